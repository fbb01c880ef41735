//! Data models for allocations, shared state, configuration and events.

mod allocation;
mod config;
mod event;
mod state;

pub use allocation::BotAllocation;
pub use config::{
    AllocationStrategy, BotConfig, PortfolioConfig, MAX_LEVERAGE, MAX_REBALANCE_FREQUENCY_SECS,
    MIN_LEVERAGE,
};
pub use event::{AllocationEvent, BotStatus, EventType, HeartbeatInfo, SyncEvent};
pub use state::{PortfolioState, BALANCE_EPSILON};
