//! Event handlers notified of sync events.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::models::SyncEvent;

/// Receiver of sync events, e.g. a notifier.
///
/// Each handler is fed from its own queue, so a slow handler only delays
/// itself. Errors are logged by the sync manager and never stop delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle_event(&self, event: &SyncEvent) -> Result<()>;
}

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle_event(&self, event: &SyncEvent) -> Result<()> {
        info!(
            event = %event.event_type,
            bot_id = %event.bot_id,
            pid = event.process_id,
            amount = %event.amount,
            "{}",
            event.description
        );
        Ok(())
    }
}
