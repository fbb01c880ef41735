//! Portfolio and bot configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::TimeDelta;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{PortfolioError, Result};

/// Leverage bounds every config is validated against.
pub const MIN_LEVERAGE: Decimal = dec!(1);
pub const MAX_LEVERAGE: Decimal = dec!(125);

/// Longest allowed rebalance interval (one year).
pub const MAX_REBALANCE_FREQUENCY_SECS: u64 = 365 * 24 * 60 * 60;

/// How shared profit is redistributed across bots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Split evenly across all allocated bots
    EqualWeight,
    /// Split by each bot's share of positive realized P&L
    PerformanceBased,
    /// Profit stays with the bot that earned it
    Custom,
}

impl FromStr for AllocationStrategy {
    type Err = PortfolioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "equal_weight" | "equal" => Ok(Self::EqualWeight),
            "performance_based" | "performance" => Ok(Self::PerformanceBased),
            "custom" => Ok(Self::Custom),
            other => Err(PortfolioError::ConfigurationInvalid(format!(
                "unknown allocation strategy: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EqualWeight => write!(f, "equal_weight"),
            Self::PerformanceBased => write!(f, "performance_based"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Policy parameters for the shared pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// Capital in the shared pool (USDT)
    pub total_balance: Decimal,

    /// Profit redistribution strategy
    pub allocation_strategy: AllocationStrategy,

    /// Maximum notional exposure as a multiple of total balance
    pub max_total_exposure: Decimal,

    /// Maximum drawdown in percent (20 = 20%)
    pub max_drawdown_percent: Decimal,

    /// Minimum time between rebalances (seconds)
    pub rebalance_frequency_secs: u64,

    /// Maximum fraction of total balance one bot's margin may consume
    pub risk_limit_per_bot: Decimal,

    /// Trip an emergency stop when health turns critical
    pub emergency_stop_enabled: bool,

    /// Allowed drift of a bot's share from its target before rebalancing
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: Decimal,

    /// Minimum dollar drift worth moving during a rebalance
    #[serde(default = "default_min_rebalance_amount")]
    pub min_rebalance_amount: Decimal,

    /// Global leverage hard cap enforced by the risk manager
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
}

fn default_rebalance_threshold() -> Decimal {
    dec!(0.05)
}

fn default_min_rebalance_amount() -> Decimal {
    dec!(10)
}

fn default_max_leverage() -> Decimal {
    dec!(100)
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            total_balance: dec!(1000),
            allocation_strategy: AllocationStrategy::EqualWeight,
            max_total_exposure: dec!(3),         // 3x balance
            max_drawdown_percent: dec!(20),      // 20%
            rebalance_frequency_secs: 3600,      // hourly
            risk_limit_per_bot: dec!(0.5),       // 50% of pool
            emergency_stop_enabled: true,
            rebalance_threshold: default_rebalance_threshold(),
            min_rebalance_amount: default_min_rebalance_amount(),
            max_leverage: default_max_leverage(),
        }
    }
}

impl PortfolioConfig {
    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_balance <= Decimal::ZERO {
            return Err(invalid(format!(
                "total_balance must be positive, got {}",
                self.total_balance
            )));
        }
        if self.max_total_exposure <= Decimal::ZERO {
            return Err(invalid(format!(
                "max_total_exposure must be positive, got {}",
                self.max_total_exposure
            )));
        }
        if self.max_drawdown_percent <= Decimal::ZERO || self.max_drawdown_percent > dec!(100) {
            return Err(invalid(format!(
                "max_drawdown_percent must be in (0, 100], got {}",
                self.max_drawdown_percent
            )));
        }
        if self.risk_limit_per_bot <= Decimal::ZERO || self.risk_limit_per_bot > Decimal::ONE {
            return Err(invalid(format!(
                "risk_limit_per_bot must be in (0, 1], got {}",
                self.risk_limit_per_bot
            )));
        }
        if self.rebalance_threshold < Decimal::ZERO || self.rebalance_threshold > Decimal::ONE {
            return Err(invalid(format!(
                "rebalance_threshold must be in [0, 1], got {}",
                self.rebalance_threshold
            )));
        }
        if self.min_rebalance_amount < Decimal::ZERO {
            return Err(invalid(format!(
                "min_rebalance_amount must not be negative, got {}",
                self.min_rebalance_amount
            )));
        }
        if self.max_leverage < MIN_LEVERAGE || self.max_leverage > MAX_LEVERAGE {
            return Err(invalid(format!(
                "max_leverage must be within [{}, {}], got {}",
                MIN_LEVERAGE, MAX_LEVERAGE, self.max_leverage
            )));
        }
        self.rebalance_interval()?;
        Ok(())
    }

    /// Minimum time between rebalances.
    pub fn rebalance_interval(&self) -> Result<TimeDelta> {
        if self.rebalance_frequency_secs > MAX_REBALANCE_FREQUENCY_SECS {
            return Err(invalid(format!(
                "rebalance_frequency_secs must be at most {}, got {}",
                MAX_REBALANCE_FREQUENCY_SECS, self.rebalance_frequency_secs
            )));
        }
        i64::try_from(self.rebalance_frequency_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                invalid(format!(
                    "rebalance_frequency_secs out of range: {}",
                    self.rebalance_frequency_secs
                ))
            })
    }
}

/// Per-bot configuration supplied by the bot's config loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Trading pair, e.g. "BTCUSDT"
    pub symbol: String,

    /// Leverage the bot trades with
    pub leverage: Decimal,

    /// Target share of the pool (0, 1]
    pub allocation_percentage: Decimal,

    /// Maximum notional position size (0 = unlimited)
    #[serde(default)]
    pub max_position_size: Decimal,

    /// Free-form grouping, e.g. "grid" or "dca"
    #[serde(default)]
    pub category: String,
}

impl BotConfig {
    pub fn new(symbol: impl Into<String>, leverage: Decimal, allocation_percentage: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            leverage,
            allocation_percentage,
            max_position_size: Decimal::ZERO,
            category: String::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(invalid("symbol must not be empty".to_string()));
        }
        if self.leverage <= Decimal::ZERO || self.leverage > MAX_LEVERAGE {
            return Err(PortfolioError::InvalidLeverage {
                leverage: self.leverage,
                min: MIN_LEVERAGE,
                max: MAX_LEVERAGE,
            });
        }
        if self.allocation_percentage <= Decimal::ZERO || self.allocation_percentage > Decimal::ONE {
            return Err(invalid(format!(
                "allocation_percentage must be in (0, 1], got {}",
                self.allocation_percentage
            )));
        }
        if self.max_position_size < Decimal::ZERO {
            return Err(invalid(format!(
                "max_position_size must not be negative, got {}",
                self.max_position_size
            )));
        }
        Ok(())
    }
}

fn invalid(reason: String) -> PortfolioError {
    PortfolioError::ConfigurationInvalid(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PortfolioConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_portfolio_config() {
        let config = PortfolioConfig {
            total_balance: Decimal::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PortfolioError::ConfigurationInvalid(_))
        ));

        let config = PortfolioConfig {
            risk_limit_per_bot: dec!(1.5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rebalance_interval_bounds() {
        let config = PortfolioConfig::default();
        assert_eq!(config.rebalance_interval().unwrap(), TimeDelta::hours(1));

        let config = PortfolioConfig {
            rebalance_frequency_secs: MAX_REBALANCE_FREQUENCY_SECS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        for secs in [MAX_REBALANCE_FREQUENCY_SECS + 1, 1 << 62, u64::MAX] {
            let config = PortfolioConfig {
                rebalance_frequency_secs: secs,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(PortfolioError::ConfigurationInvalid(_))
            ));
            assert!(config.rebalance_interval().is_err());
        }
    }

    #[test]
    fn test_bot_config_validation() {
        assert!(BotConfig::new("BTCUSDT", dec!(10), dec!(0.5)).validate().is_ok());

        let err = BotConfig::new("BTCUSDT", dec!(150), dec!(0.5)).validate();
        assert!(matches!(err, Err(PortfolioError::InvalidLeverage { .. })));

        let err = BotConfig::new("", dec!(10), dec!(0.5)).validate();
        assert!(matches!(err, Err(PortfolioError::ConfigurationInvalid(_))));

        let err = BotConfig::new("ETHUSDT", dec!(10), dec!(1.01)).validate();
        assert!(matches!(err, Err(PortfolioError::ConfigurationInvalid(_))));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "equal_weight".parse::<AllocationStrategy>().unwrap(),
            AllocationStrategy::EqualWeight
        );
        assert_eq!(
            "Performance_Based".parse::<AllocationStrategy>().unwrap(),
            AllocationStrategy::PerformanceBased
        );
        assert!("kelly".parse::<AllocationStrategy>().is_err());
    }

    #[test]
    fn test_config_json_defaults() {
        let json = r#"{
            "total_balance": "5000",
            "allocation_strategy": "performance_based",
            "max_total_exposure": "2",
            "max_drawdown_percent": "15",
            "rebalance_frequency_secs": 600,
            "risk_limit_per_bot": "0.4",
            "emergency_stop_enabled": false
        }"#;
        let config: PortfolioConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.allocation_strategy, AllocationStrategy::PerformanceBased);
        assert_eq!(config.rebalance_threshold, dec!(0.05));
        assert_eq!(config.max_leverage, dec!(100));
        assert!(config.validate().is_ok());
    }
}
