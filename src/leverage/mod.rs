//! Leverage and margin math: sizing, liquidation estimates, position safety.

mod calculator;
mod safety;

pub use calculator::LeverageCalculator;
pub use safety::{
    leverage_to_margin_percent, liquidation_price, margin_percent_to_leverage, PositionSafety,
    PositionSide, PositionSnapshot, RiskLevel,
};
