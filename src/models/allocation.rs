//! A single bot's slice of the shared capital pool.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Capital, margin and P&L bookkeeping for one bot.
///
/// Invariants maintained by the allocation manager:
/// `used_balance == position_margin_used`,
/// `available_balance == allocated_balance - used_balance`,
/// `position_margin_used <= allocated_balance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotAllocation {
    pub bot_id: String,

    pub symbol: String,

    /// Capital assigned from the pool
    pub allocated_balance: Decimal,

    /// Capital tied up as margin
    pub used_balance: Decimal,

    /// Capital free for new margin
    pub available_balance: Decimal,

    /// Notional value of the open position
    pub current_position: Decimal,

    pub average_price: Decimal,

    pub leverage: Decimal,

    #[serde(default)]
    pub unrealized_pnl: Decimal,

    #[serde(default)]
    pub realized_pnl: Decimal,

    /// Margin reserved by the open position
    pub position_margin_used: Decimal,

    /// Target share of the pool (0, 1]
    pub allocation_percentage: Decimal,

    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl BotAllocation {
    /// Fresh allocation with no open position.
    pub fn new(
        bot_id: String,
        symbol: String,
        allocated_balance: Decimal,
        leverage: Decimal,
        allocation_percentage: Decimal,
    ) -> Self {
        Self {
            bot_id,
            symbol,
            allocated_balance,
            used_balance: Decimal::ZERO,
            available_balance: allocated_balance,
            current_position: Decimal::ZERO,
            average_price: Decimal::ZERO,
            leverage,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            position_margin_used: Decimal::ZERO,
            allocation_percentage,
            last_updated: Utc::now(),
        }
    }

    /// Set the margin in use and re-derive used/available balances.
    pub fn apply_margin(&mut self, margin: Decimal) {
        self.position_margin_used = margin;
        self.recompute_balances();
    }

    /// Re-derive used/available from allocated balance and margin.
    pub fn recompute_balances(&mut self) {
        self.used_balance = self.position_margin_used;
        self.available_balance = self.allocated_balance - self.used_balance;
        self.last_updated = Utc::now();
    }

    pub fn has_open_position(&self) -> bool {
        self.current_position > Decimal::ZERO
    }

    /// Fraction of allocated capital in use as margin.
    pub fn margin_utilization(&self) -> Decimal {
        if self.allocated_balance.is_zero() {
            return Decimal::ZERO;
        }
        self.position_margin_used / self.allocated_balance
    }

    pub fn balances_consistent(&self) -> bool {
        self.used_balance == self.position_margin_used
            && self.available_balance == self.allocated_balance - self.used_balance
            && self.position_margin_used <= self.allocated_balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_allocation_is_consistent() {
        let alloc = BotAllocation::new(
            "bot-a".to_string(),
            "BTCUSDT".to_string(),
            dec!(500),
            dec!(10),
            dec!(0.5),
        );
        assert_eq!(alloc.available_balance, dec!(500));
        assert!(alloc.balances_consistent());
        assert!(!alloc.has_open_position());
    }

    #[test]
    fn test_apply_margin() {
        let mut alloc = BotAllocation::new(
            "bot-a".to_string(),
            "BTCUSDT".to_string(),
            dec!(500),
            dec!(10),
            dec!(0.5),
        );
        alloc.apply_margin(dec!(100));

        assert_eq!(alloc.used_balance, dec!(100));
        assert_eq!(alloc.available_balance, dec!(400));
        assert_eq!(alloc.margin_utilization(), dec!(0.2));
        assert!(alloc.balances_consistent());
    }
}
