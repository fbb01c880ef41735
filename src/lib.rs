//! Shared-balance portfolio coordination for multiple trading-bot processes.
//!
//! Bots running as separate processes draw capital from one pool recorded
//! in a shared, file-locked JSON document. Each process runs a
//! [`PortfolioManager`] over the shared state and, optionally, a
//! [`SyncManager`] that keeps it fresh and broadcasts events.

pub mod error;
pub mod leverage;
pub mod models;
pub mod portfolio;
pub mod risk;
pub mod state;
pub mod sync;

pub use error::{PortfolioError, Result};
pub use models::{BotAllocation, BotConfig, PortfolioConfig, PortfolioState};
pub use portfolio::{AllocationManager, HealthStatus, PortfolioHealth, PortfolioManager};
pub use state::{FileStateStore, StateStore};
pub use sync::{EventHandler, LoggingEventHandler, SyncConfig, SyncManager};
