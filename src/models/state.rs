//! The serializable root document shared between bot processes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::{BotAllocation, PortfolioConfig};
use crate::error::{PortfolioError, Result};

/// Rounding tolerance for balance comparisons.
pub const BALANCE_EPSILON: Decimal = dec!(0.01);

/// Shared portfolio ledger as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub total_balance: Decimal,

    pub total_profit: Decimal,

    pub last_updated: DateTime<Utc>,

    /// Bot id -> allocation
    pub allocations: HashMap<String, BotAllocation>,

    /// Config snapshot of the process that last wrote the state
    pub global_settings: PortfolioConfig,

    /// Incremented on every persisted mutation
    pub version: u64,

    #[serde(default)]
    pub lock_holder: Option<String>,

    #[serde(default)]
    pub lock_time: Option<DateTime<Utc>>,
}

impl PortfolioState {
    /// Empty ledger seeded from a config.
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            total_balance: config.total_balance,
            total_profit: Decimal::ZERO,
            last_updated: Utc::now(),
            allocations: HashMap::new(),
            global_settings: config,
            version: 0,
            lock_holder: None,
            lock_time: None,
        }
    }

    pub fn total_allocated(&self) -> Decimal {
        self.allocations.values().map(|a| a.allocated_balance).sum()
    }

    /// Structural checks applied to every loaded document.
    pub fn validate_structure(&self) -> Result<()> {
        if self.total_balance < Decimal::ZERO {
            return Err(corrupted(format!(
                "negative total balance {}",
                self.total_balance
            )));
        }

        for (key, alloc) in &self.allocations {
            if key != &alloc.bot_id {
                return Err(corrupted(format!(
                    "allocation key {} does not match bot id {}",
                    key, alloc.bot_id
                )));
            }
            if alloc.allocated_balance < Decimal::ZERO
                || alloc.used_balance < Decimal::ZERO
                || alloc.position_margin_used < Decimal::ZERO
            {
                return Err(corrupted(format!("negative balance for bot {}", key)));
            }
            if alloc.leverage < Decimal::ZERO {
                return Err(corrupted(format!(
                    "negative leverage {} for bot {}",
                    alloc.leverage, key
                )));
            }
        }

        Ok(())
    }

    /// Ledger-level invariants: capital is never over-committed.
    pub fn validate_invariants(&self) -> Result<()> {
        let allocated = self.total_allocated();
        if allocated > self.total_balance + BALANCE_EPSILON {
            return Err(corrupted(format!(
                "allocated {} exceeds total balance {}",
                allocated, self.total_balance
            )));
        }

        for alloc in self.allocations.values() {
            if alloc.position_margin_used > alloc.allocated_balance + BALANCE_EPSILON {
                return Err(corrupted(format!(
                    "bot {} margin {} exceeds allocation {}",
                    alloc.bot_id, alloc.position_margin_used, alloc.allocated_balance
                )));
            }
        }

        Ok(())
    }
}

fn corrupted(reason: String) -> PortfolioError {
    PortfolioError::StateCorrupted(reason)
}
