//! Stateless risk policy checks and aggregate risk metrics.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PortfolioError, Result};
use crate::leverage::LeverageCalculator;
use crate::models::{BotAllocation, PortfolioConfig};

/// Aggregated risk view over the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Total notional across all bots
    pub total_exposure: Decimal,
    pub exposure_by_symbol: HashMap<String, Decimal>,
    /// Exposure-weighted average leverage
    pub weighted_leverage: Decimal,
    /// Largest single-symbol share of total exposure
    pub concentration: Decimal,
    /// Margin in use over capital allocated
    pub margin_utilization: Decimal,
    /// Total exposure as a multiple of total balance
    pub exposure_ratio: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    /// Total balance plus unrealized P&L
    pub equity: Decimal,
    /// Fraction below the equity peak (0.0 to 1.0)
    pub drawdown_from_peak: Decimal,
}

/// Gatekeeper consulted before any position mutation.
#[derive(Debug, Clone)]
pub struct RiskManager {
    calculator: LeverageCalculator,
    max_total_exposure: Decimal,
    max_leverage: Decimal,
    risk_limit_per_bot: Decimal,
}

impl Default for RiskManager {
    fn default() -> Self {
        Self::from_config(&PortfolioConfig::default())
    }
}

impl RiskManager {
    pub fn new(max_total_exposure: Decimal, max_leverage: Decimal, risk_limit_per_bot: Decimal) -> Self {
        Self {
            calculator: LeverageCalculator::default(),
            max_total_exposure,
            max_leverage,
            risk_limit_per_bot,
        }
    }

    pub fn from_config(config: &PortfolioConfig) -> Self {
        Self::new(
            config.max_total_exposure,
            config.max_leverage,
            config.risk_limit_per_bot,
        )
    }

    pub fn max_total_exposure(&self) -> Decimal {
        self.max_total_exposure
    }

    pub fn max_leverage(&self) -> Decimal {
        self.max_leverage
    }

    /// Reject non-positive notionals and leverage above the hard cap.
    pub fn validate_position(&self, bot_id: &str, position_value: Decimal, leverage: Decimal) -> Result<()> {
        if position_value <= Decimal::ZERO {
            return Err(PortfolioError::ExceedsRiskLimit {
                bot_id: bot_id.to_string(),
                reason: format!("position value must be positive, got {}", position_value),
            });
        }
        if leverage <= Decimal::ZERO || leverage > self.max_leverage {
            return Err(PortfolioError::InvalidLeverage {
                leverage,
                min: self.calculator.min_leverage(),
                max: self.max_leverage,
            });
        }
        Ok(())
    }

    pub fn validate_margin(&self, bot_id: &str, required: Decimal, available: Decimal) -> Result<()> {
        if required > available {
            return Err(PortfolioError::InsufficientMargin {
                bot_id: bot_id.to_string(),
                required,
                available,
            });
        }
        Ok(())
    }

    /// One bot's margin may not consume more than its share of the pool.
    pub fn check_bot_risk(&self, bot_id: &str, margin: Decimal, total_balance: Decimal) -> Result<()> {
        let limit = total_balance * self.risk_limit_per_bot;
        if margin > limit {
            return Err(PortfolioError::ExceedsRiskLimit {
                bot_id: bot_id.to_string(),
                reason: format!("margin {} above per-bot limit {}", margin, limit),
            });
        }
        Ok(())
    }

    pub fn is_within_risk_limits(&self, total_exposure: Decimal, available_balance: Decimal) -> bool {
        if available_balance <= Decimal::ZERO {
            return total_exposure <= Decimal::ZERO;
        }
        total_exposure / available_balance <= self.max_total_exposure
    }

    pub fn calculate_metrics<'a>(
        &self,
        allocations: impl IntoIterator<Item = &'a BotAllocation>,
        total_balance: Decimal,
        peak_equity: Decimal,
    ) -> RiskMetrics {
        let mut metrics = RiskMetrics::default();
        let mut leverage_weighted_sum = Decimal::ZERO;
        let mut margin_used = Decimal::ZERO;
        let mut allocated = Decimal::ZERO;

        for alloc in allocations {
            metrics.total_exposure += alloc.current_position;
            *metrics
                .exposure_by_symbol
                .entry(alloc.symbol.clone())
                .or_insert(Decimal::ZERO) += alloc.current_position;
            leverage_weighted_sum += alloc.current_position * alloc.leverage;
            margin_used += alloc.position_margin_used;
            allocated += alloc.allocated_balance;
            metrics.unrealized_pnl += alloc.unrealized_pnl;
            metrics.realized_pnl += alloc.realized_pnl;
        }

        if metrics.total_exposure > Decimal::ZERO {
            metrics.weighted_leverage = leverage_weighted_sum / metrics.total_exposure;
            let largest = metrics
                .exposure_by_symbol
                .values()
                .copied()
                .max()
                .unwrap_or(Decimal::ZERO);
            metrics.concentration = largest / metrics.total_exposure;
        }
        if allocated > Decimal::ZERO {
            metrics.margin_utilization = margin_used / allocated;
        }
        if total_balance > Decimal::ZERO {
            metrics.exposure_ratio = metrics.total_exposure / total_balance;
        }

        metrics.equity = total_balance + metrics.unrealized_pnl;
        if peak_equity > Decimal::ZERO && metrics.equity < peak_equity {
            metrics.drawdown_from_peak = (peak_equity - metrics.equity) / peak_equity;
        }

        debug!(
            exposure = %metrics.total_exposure,
            leverage = %metrics.weighted_leverage,
            drawdown = %metrics.drawdown_from_peak,
            "Calculated risk metrics"
        );

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_allocation(bot_id: &str, symbol: &str, position: Decimal, leverage: Decimal) -> BotAllocation {
        let mut alloc = BotAllocation::new(
            bot_id.to_string(),
            symbol.to_string(),
            dec!(500),
            leverage,
            dec!(0.5),
        );
        alloc.current_position = position;
        alloc.apply_margin(position / leverage);
        alloc
    }

    #[test]
    fn test_validate_position() {
        let risk = RiskManager::new(dec!(3), dec!(50), dec!(0.5));
        assert!(risk.validate_position("a", dec!(1000), dec!(10)).is_ok());
        assert!(matches!(
            risk.validate_position("a", Decimal::ZERO, dec!(10)),
            Err(PortfolioError::ExceedsRiskLimit { .. })
        ));
        assert!(matches!(
            risk.validate_position("a", dec!(1000), dec!(75)),
            Err(PortfolioError::InvalidLeverage { .. })
        ));
    }

    #[test]
    fn test_exposure_limits() {
        let risk = RiskManager::new(dec!(3), dec!(50), dec!(0.5));
        assert!(risk.is_within_risk_limits(dec!(3000), dec!(1000)));
        assert!(!risk.is_within_risk_limits(dec!(3001), dec!(1000)));
        assert!(risk.is_within_risk_limits(Decimal::ZERO, Decimal::ZERO));
        assert!(!risk.is_within_risk_limits(dec!(1), Decimal::ZERO));
    }

    #[test]
    fn test_margin_and_bot_limits() {
        let risk = RiskManager::new(dec!(3), dec!(50), dec!(0.5));
        assert!(risk.validate_margin("a", dec!(100), dec!(500)).is_ok());
        assert!(matches!(
            risk.validate_margin("a", dec!(600), dec!(500)),
            Err(PortfolioError::InsufficientMargin { .. })
        ));
        assert!(risk.check_bot_risk("a", dec!(500), dec!(1000)).is_ok());
        assert!(risk.check_bot_risk("a", dec!(501), dec!(1000)).is_err());
    }

    #[test]
    fn test_metrics() {
        let risk = RiskManager::default();
        let allocations = vec![
            make_allocation("a", "BTCUSDT", dec!(1000), dec!(10)),
            make_allocation("b", "ETHUSDT", dec!(500), dec!(5)),
            make_allocation("c", "BTCUSDT", dec!(500), dec!(5)),
        ];

        let metrics = risk.calculate_metrics(&allocations, dec!(1500), dec!(1500));

        assert_eq!(metrics.total_exposure, dec!(2000));
        assert_eq!(metrics.exposure_by_symbol["BTCUSDT"], dec!(1500));
        assert_eq!(metrics.concentration, dec!(0.75));
        // (1000*10 + 500*5 + 500*5) / 2000
        assert_eq!(metrics.weighted_leverage, dec!(7.5));
        // (100 + 100 + 100) / 1500
        assert_eq!(metrics.margin_utilization, dec!(0.2));
        assert_eq!(metrics.drawdown_from_peak, Decimal::ZERO);
    }

    #[test]
    fn test_drawdown_from_peak() {
        let risk = RiskManager::default();
        let mut alloc = make_allocation("a", "BTCUSDT", dec!(1000), dec!(10));
        alloc.unrealized_pnl = dec!(-200);

        let metrics = risk.calculate_metrics([&alloc], dec!(1000), dec!(1000));
        assert_eq!(metrics.equity, dec!(800));
        assert_eq!(metrics.drawdown_from_peak, dec!(0.2));
    }
}
