//! Leverage helpers: conversions, liquidation estimates and position safety.

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::LeverageCalculator;

/// Share of the margin that can be lost before liquidation (maintenance buffer).
const LIQUIDATION_BUFFER: Decimal = dec!(0.9);

// Margin utilization tiers
const UTILIZATION_MEDIUM: Decimal = dec!(0.7);
const UTILIZATION_HIGH: Decimal = dec!(0.8);
const UTILIZATION_CRITICAL: Decimal = dec!(0.9);

// Distance-to-liquidation tiers (fraction of current price)
const DISTANCE_MEDIUM: Decimal = dec!(0.2);
const DISTANCE_HIGH: Decimal = dec!(0.15);
const DISTANCE_CRITICAL: Decimal = dec!(0.1);

// Effective leverage tiers
const LEVERAGE_MEDIUM: Decimal = dec!(10);
const LEVERAGE_HIGH: Decimal = dec!(20);
const LEVERAGE_CRITICAL: Decimal = dec!(50);

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

/// Risk tier, ordered from safest to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Composite safety assessment of one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSafety {
    pub risk_level: RiskLevel,
    pub margin_utilization: Decimal,
    pub effective_leverage: Decimal,
    pub liquidation_price: Option<Decimal>,
    /// Fraction of the current price the market must move to liquidate
    pub distance_to_liquidation: Option<Decimal>,
    pub warnings: Vec<String>,
}

impl PositionSafety {
    pub fn is_safe(&self) -> bool {
        self.risk_level <= RiskLevel::Medium
    }
}

/// Inputs describing the position to assess.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub position_value: Decimal,
    pub margin_used: Decimal,
    pub allocated_balance: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub leverage: Decimal,
    pub side: PositionSide,
}

/// Leverage implied by a margin requirement in percent (10% -> 10x).
pub fn margin_percent_to_leverage(margin_percent: Decimal) -> Decimal {
    if margin_percent <= Decimal::ZERO {
        return Decimal::ONE;
    }
    dec!(100) / margin_percent
}

/// Margin requirement in percent for a leverage (10x -> 10%).
pub fn leverage_to_margin_percent(leverage: Decimal) -> Decimal {
    if leverage <= Decimal::ZERO {
        return dec!(100);
    }
    dec!(100) / leverage
}

/// Approximate liquidation price ignoring fees and funding.
pub fn liquidation_price(entry_price: Decimal, leverage: Decimal, side: PositionSide) -> Option<Decimal> {
    if entry_price <= Decimal::ZERO || leverage <= Decimal::ZERO {
        return None;
    }
    let move_to_liquidation = (Decimal::ONE / leverage) * LIQUIDATION_BUFFER;
    let price = match side {
        PositionSide::Long => entry_price * (Decimal::ONE - move_to_liquidation),
        PositionSide::Short => entry_price * (Decimal::ONE + move_to_liquidation),
    };
    Some(price.max(Decimal::ZERO))
}

impl LeverageCalculator {
    /// Rate a position by margin utilization, effective leverage and
    /// distance to liquidation; the worst of the three wins.
    pub fn assess_position_safety(&self, position: &PositionSnapshot) -> PositionSafety {
        let mut warnings = Vec::new();

        if position.position_value <= Decimal::ZERO {
            return PositionSafety {
                risk_level: RiskLevel::Low,
                margin_utilization: Decimal::ZERO,
                effective_leverage: Decimal::ZERO,
                liquidation_price: None,
                distance_to_liquidation: None,
                warnings,
            };
        }

        let margin_utilization = if position.allocated_balance > Decimal::ZERO {
            position.margin_used / position.allocated_balance
        } else {
            Decimal::ONE
        };
        let effective_leverage = self.effective_leverage(position.position_value, position.margin_used);

        let liquidation = liquidation_price(position.entry_price, position.leverage, position.side);
        let distance = match liquidation {
            Some(liq) if position.current_price > Decimal::ZERO => {
                Some((position.current_price - liq).abs() / position.current_price)
            }
            _ => None,
        };

        let utilization_level = tier_ascending(
            margin_utilization,
            UTILIZATION_MEDIUM,
            UTILIZATION_HIGH,
            UTILIZATION_CRITICAL,
        );
        if utilization_level > RiskLevel::Low {
            warnings.push(format!(
                "margin utilization {:.1}%",
                margin_utilization * dec!(100)
            ));
        }

        let leverage_level = tier_ascending(
            effective_leverage,
            LEVERAGE_MEDIUM,
            LEVERAGE_HIGH,
            LEVERAGE_CRITICAL,
        );
        if leverage_level > RiskLevel::Low {
            warnings.push(format!("effective leverage {:.1}x", effective_leverage));
        }

        let distance_level = match distance {
            Some(d) if d <= DISTANCE_CRITICAL => RiskLevel::Critical,
            Some(d) if d <= DISTANCE_HIGH => RiskLevel::High,
            Some(d) if d <= DISTANCE_MEDIUM => RiskLevel::Medium,
            _ => RiskLevel::Low,
        };
        if let (true, Some(d)) = (distance_level > RiskLevel::Low, distance) {
            warnings.push(format!("{:.1}% from liquidation", d * dec!(100)));
        }

        let risk_level = utilization_level.max(leverage_level).max(distance_level);

        PositionSafety {
            risk_level,
            margin_utilization,
            effective_leverage,
            liquidation_price: liquidation,
            distance_to_liquidation: distance,
            warnings,
        }
    }
}

fn tier_ascending(value: Decimal, medium: Decimal, high: Decimal, critical: Decimal) -> RiskLevel {
    if value >= critical {
        RiskLevel::Critical
    } else if value >= high {
        RiskLevel::High
    } else if value >= medium {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_snapshot(margin_used: Decimal, leverage: Decimal, current_price: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            position_value: margin_used * leverage,
            margin_used,
            allocated_balance: dec!(1000),
            entry_price: dec!(50000),
            current_price,
            leverage,
            side: PositionSide::Long,
        }
    }

    #[test]
    fn test_conversions() {
        assert_eq!(margin_percent_to_leverage(dec!(10)), dec!(10));
        assert_eq!(margin_percent_to_leverage(Decimal::ZERO), Decimal::ONE);
        assert_eq!(leverage_to_margin_percent(dec!(20)), dec!(5));
        assert_eq!(leverage_to_margin_percent(Decimal::ZERO), dec!(100));
    }

    #[test]
    fn test_liquidation_price() {
        // 10x long: 9% adverse move
        assert_eq!(
            liquidation_price(dec!(50000), dec!(10), PositionSide::Long),
            Some(dec!(45500))
        );
        assert_eq!(
            liquidation_price(dec!(50000), dec!(10), PositionSide::Short),
            Some(dec!(54500))
        );
        assert_eq!(liquidation_price(dec!(50000), Decimal::ZERO, PositionSide::Long), None);
    }

    #[test]
    fn test_low_risk_position() {
        let calc = LeverageCalculator::default();
        // 2x, 10% utilization: liquidation at 27500, 45% away
        let safety = calc.assess_position_safety(&make_snapshot(dec!(100), dec!(2), dec!(50000)));
        assert_eq!(safety.risk_level, RiskLevel::Low);
        assert!(safety.is_safe());
        assert!(safety.warnings.is_empty());
    }

    #[test]
    fn test_high_utilization_is_critical() {
        let calc = LeverageCalculator::default();
        let safety = calc.assess_position_safety(&make_snapshot(dec!(950), dec!(2), dec!(50000)));
        assert_eq!(safety.risk_level, RiskLevel::Critical);
        assert!(!safety.is_safe());
    }

    #[test]
    fn test_near_liquidation() {
        let calc = LeverageCalculator::default();
        // 2x long, liquidation at 27500; price 32000 is ~14% away
        let safety = calc.assess_position_safety(&make_snapshot(dec!(100), dec!(2), dec!(32000)));
        assert_eq!(safety.risk_level, RiskLevel::High);
        assert_eq!(safety.liquidation_price, Some(dec!(27500)));
        assert_eq!(safety.distance_to_liquidation, Some(dec!(0.140625)));
    }

    #[test]
    fn test_flat_position_is_low_risk() {
        let calc = LeverageCalculator::default();
        let safety = calc.assess_position_safety(&make_snapshot(Decimal::ZERO, dec!(10), dec!(50000)));
        assert_eq!(safety.risk_level, RiskLevel::Low);
        assert!(safety.liquidation_price.is_none());
    }
}
