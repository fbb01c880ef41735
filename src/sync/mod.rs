//! Heartbeat and state synchronization between bot processes.

mod config;
mod handler;
mod manager;

pub use config::SyncConfig;
pub use handler::{EventHandler, LoggingEventHandler};
pub use manager::SyncManager;
