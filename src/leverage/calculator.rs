//! Margin and position-sizing math.

use rust_decimal::Decimal;

use crate::error::{PortfolioError, Result};
use crate::models::{MAX_LEVERAGE, MIN_LEVERAGE};

/// Pure margin calculator bounded to `[min_leverage, max_leverage]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeverageCalculator {
    min_leverage: Decimal,
    max_leverage: Decimal,
}

impl Default for LeverageCalculator {
    fn default() -> Self {
        Self {
            min_leverage: MIN_LEVERAGE,
            max_leverage: MAX_LEVERAGE,
        }
    }
}

impl LeverageCalculator {
    pub fn new(min_leverage: Decimal, max_leverage: Decimal) -> Result<Self> {
        if min_leverage <= Decimal::ZERO || max_leverage < min_leverage {
            return Err(PortfolioError::ConfigurationInvalid(format!(
                "invalid leverage bounds [{}, {}]",
                min_leverage, max_leverage
            )));
        }
        Ok(Self {
            min_leverage,
            max_leverage,
        })
    }

    pub fn min_leverage(&self) -> Decimal {
        self.min_leverage
    }

    pub fn max_leverage(&self) -> Decimal {
        self.max_leverage
    }

    fn clamp(&self, leverage: Decimal) -> Decimal {
        leverage.max(self.min_leverage).min(self.max_leverage)
    }

    /// Margin required to hold `position_value` at `leverage`.
    ///
    /// Leverage outside the bounds is clamped; non-positive leverage
    /// requires the full notional.
    pub fn required_margin(&self, position_value: Decimal, leverage: Decimal) -> Decimal {
        if leverage <= Decimal::ZERO {
            return position_value;
        }
        position_value / self.clamp(leverage)
    }

    /// Largest notional that `available_margin` can carry at `leverage`.
    pub fn max_position_size(&self, available_margin: Decimal, leverage: Decimal) -> Decimal {
        if available_margin <= Decimal::ZERO || leverage <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        available_margin * self.clamp(leverage)
    }

    pub fn validate_leverage(&self, leverage: Decimal) -> Result<()> {
        if leverage <= Decimal::ZERO || leverage < self.min_leverage || leverage > self.max_leverage
        {
            return Err(PortfolioError::InvalidLeverage {
                leverage,
                min: self.min_leverage,
                max: self.max_leverage,
            });
        }
        Ok(())
    }

    /// Actual leverage of a position given the margin backing it.
    pub fn effective_leverage(&self, position_value: Decimal, margin_used: Decimal) -> Decimal {
        if margin_used.is_zero() {
            return Decimal::ONE;
        }
        position_value / margin_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_required_margin() {
        let calc = LeverageCalculator::default();
        assert_eq!(calc.required_margin(dec!(1000), dec!(10)), dec!(100));
        assert_eq!(calc.required_margin(dec!(1000), dec!(1)), dec!(1000));

        // Non-positive leverage requires full notional
        assert_eq!(calc.required_margin(dec!(1000), Decimal::ZERO), dec!(1000));
        assert_eq!(calc.required_margin(dec!(1000), dec!(-5)), dec!(1000));

        // Clamped to bounds
        assert_eq!(calc.required_margin(dec!(1000), dec!(0.5)), dec!(1000));
        assert_eq!(calc.required_margin(dec!(1250), dec!(500)), dec!(10));
    }

    #[test]
    fn test_margin_times_leverage_recovers_notional() {
        let calc = LeverageCalculator::default();
        let tolerance = dec!(0.0000001);

        for leverage in [dec!(1), dec!(3), dec!(7), dec!(20), dec!(33), dec!(125)] {
            for value in [dec!(1), dec!(999.99), dec!(50000), dec!(123456.789)] {
                let margin = calc.required_margin(value, leverage);
                let diff = (margin * leverage - value).abs();
                assert!(diff < tolerance, "value {} leverage {}", value, leverage);
            }
        }
    }

    #[test]
    fn test_max_position_size() {
        let calc = LeverageCalculator::default();
        assert_eq!(calc.max_position_size(dec!(100), dec!(10)), dec!(1000));
        assert_eq!(calc.max_position_size(Decimal::ZERO, dec!(10)), Decimal::ZERO);
        assert_eq!(calc.max_position_size(dec!(100), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(calc.max_position_size(dec!(100), dec!(200)), dec!(12500));
    }

    #[test]
    fn test_validate_leverage() {
        let calc = LeverageCalculator::default();
        assert!(calc.validate_leverage(dec!(1)).is_ok());
        assert!(calc.validate_leverage(dec!(125)).is_ok());
        assert!(calc.validate_leverage(Decimal::ZERO).is_err());
        assert!(calc.validate_leverage(dec!(0.5)).is_err());
        assert!(matches!(
            calc.validate_leverage(dec!(126)),
            Err(PortfolioError::InvalidLeverage { .. })
        ));
    }

    #[test]
    fn test_effective_leverage() {
        let calc = LeverageCalculator::default();
        assert_eq!(calc.effective_leverage(dec!(1000), dec!(100)), dec!(10));
        assert_eq!(calc.effective_leverage(dec!(1000), Decimal::ZERO), Decimal::ONE);
    }

    #[test]
    fn test_custom_bounds() {
        assert!(LeverageCalculator::new(dec!(2), dec!(1)).is_err());
        let calc = LeverageCalculator::new(dec!(1), dec!(20)).unwrap();
        assert!(calc.validate_leverage(dec!(25)).is_err());
        assert_eq!(calc.required_margin(dec!(1000), dec!(50)), dec!(50));
    }
}
