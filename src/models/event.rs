//! Audit-trail events and liveness records.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::BotAllocation;

/// Kind of ledger or sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Allocate,
    Deallocate,
    ProfitRecord,
    ProfitShare,
    Rebalance,
    Register,
    Unregister,
    PositionUpdate,
    Heartbeat,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allocate => "ALLOCATE",
            Self::Deallocate => "DEALLOCATE",
            Self::ProfitRecord => "PROFIT_RECORD",
            Self::ProfitShare => "PROFIT_SHARE",
            Self::Rebalance => "REBALANCE",
            Self::Register => "REGISTER",
            Self::Unregister => "UNREGISTER",
            Self::PositionUpdate => "POSITION_UPDATE",
            Self::Heartbeat => "HEARTBEAT",
        };
        write!(f, "{}", s)
    }
}

/// Ledger mutation recorded by the allocation manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub bot_id: String,
    pub amount: Decimal,
    pub description: String,
    pub before: Option<BotAllocation>,
    pub after: Option<BotAllocation>,
}

impl AllocationEvent {
    pub fn new(
        event_type: EventType,
        bot_id: impl Into<String>,
        amount: Decimal,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            bot_id: bot_id.into(),
            amount,
            description: description.into(),
            before: None,
            after: None,
        }
    }

    pub fn with_snapshots(
        mut self,
        before: Option<BotAllocation>,
        after: Option<BotAllocation>,
    ) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}

/// Event broadcast by a sync manager to its handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub bot_id: String,
    /// Identity of the emitting process
    pub process_id: u32,
    pub amount: Decimal,
    pub description: String,
}

impl SyncEvent {
    pub fn new(
        event_type: EventType,
        bot_id: impl Into<String>,
        amount: Decimal,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            bot_id: bot_id.into(),
            process_id: std::process::id(),
            amount,
            description: description.into(),
        }
    }
}

/// Liveness status derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Active,
    Inactive,
    Dead,
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Inactive => write!(f, "INACTIVE"),
            Self::Dead => write!(f, "DEAD"),
        }
    }
}

/// Last heartbeat seen from a bot process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub bot_id: String,
    pub last_seen: DateTime<Utc>,
    pub status: BotStatus,
    pub process_id: u32,
    pub version: String,
}

impl HeartbeatInfo {
    /// Heartbeat for the current process.
    pub fn local(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            last_seen: Utc::now(),
            status: BotStatus::Active,
            process_id: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
