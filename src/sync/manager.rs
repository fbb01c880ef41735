//! Synchronization manager: heartbeat and sync loops for one bot process.
//!
//! The sync loop periodically reloads the shared state under the file lock
//! so this process sees other bots' changes. Local mutations go through the
//! portfolio façade and are then broadcast to registered event handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EventHandler, SyncConfig};
use crate::error::Result;
use crate::models::{BotAllocation, BotConfig, BotStatus, EventType, HeartbeatInfo, SyncEvent};
use crate::portfolio::{PortfolioManager, RebalanceAdjustment};

struct HandlerSlot {
    name: String,
    tx: mpsc::UnboundedSender<SyncEvent>,
}

/// Runs the heartbeat and sync loops and fans events out to handlers.
pub struct SyncManager {
    bot_id: String,
    config: SyncConfig,
    portfolio: Arc<PortfolioManager>,

    handlers: Arc<RwLock<Vec<HandlerSlot>>>,
    heartbeats: Arc<RwLock<HashMap<String, HeartbeatInfo>>>,
    last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,

    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(bot_id: impl Into<String>, portfolio: Arc<PortfolioManager>, config: SyncConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bot_id: bot_id.into(),
            config,
            portfolio,
            handlers: Arc::new(RwLock::new(Vec::new())),
            heartbeats: Arc::new(RwLock::new(HashMap::new())),
            last_sync: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn portfolio(&self) -> &Arc<PortfolioManager> {
        &self.portfolio
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Attach a handler with its own delivery queue and task.
    pub async fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SyncEvent>();
        let name = handler.name().to_string();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = handler.handle_event(&event).await {
                    warn!(
                        handler = %handler.name(),
                        event = %event.event_type,
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        });

        debug!(handler = %name, "Added event handler");
        self.handlers.write().await.push(HandlerSlot { name, tx });
    }

    /// Deliver an event to every handler.
    pub async fn broadcast(&self, event: SyncEvent) {
        let handlers = self.handlers.read().await;
        for slot in handlers.iter() {
            if slot.tx.send(event.clone()).is_err() {
                warn!(handler = %slot.name, "Event handler queue closed");
            }
        }
    }

    /// Spawn the heartbeat and sync loops. No-op if already running.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.record_heartbeat(HeartbeatInfo::local(&self.bot_id)).await;

        let heartbeat = {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(manager.config.heartbeat_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => manager.heartbeat_once().await,
                        _ = shutdown.recv() => break,
                    }
                }
                debug!(bot_id = %manager.bot_id, "Heartbeat loop stopped");
            })
        };

        let sync = {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(manager.config.sync_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = manager.sync_once().await {
                                if e.is_retryable() {
                                    debug!(error = %e, "Sync skipped, state locked");
                                } else {
                                    warn!(error = %e, "Sync failed");
                                }
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                debug!(bot_id = %manager.bot_id, "Sync loop stopped");
            })
        };

        self.tasks.lock().await.extend([heartbeat, sync]);
        info!(
            bot_id = %self.bot_id,
            heartbeat = ?self.config.heartbeat_interval,
            sync = ?self.config.sync_interval,
            "Sync manager started"
        );
    }

    /// Signal both loops to stop and wait for them.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }
        info!(bot_id = %self.bot_id, "Sync manager stopped");
    }

    /// One locked reload of the shared state.
    pub async fn sync_once(&self) -> Result<bool> {
        let changed = self.portfolio.sync_with_timeout(self.config.lock_timeout).await?;
        *self.last_sync.write().await = Some(Utc::now());
        Ok(changed)
    }

    async fn heartbeat_once(&self) {
        let info = HeartbeatInfo::local(&self.bot_id);
        self.record_heartbeat(info).await;
        self.sweep_liveness().await;
        self.broadcast(SyncEvent::new(
            EventType::Heartbeat,
            &self.bot_id,
            Decimal::ZERO,
            "heartbeat",
        ))
        .await;
    }

    /// Record a heartbeat seen from any bot.
    pub async fn record_heartbeat(&self, mut info: HeartbeatInfo) {
        info.status = BotStatus::Active;
        let mut heartbeats = self.heartbeats.write().await;
        if let Some(previous) = heartbeats.get(&info.bot_id) {
            if previous.status != BotStatus::Active {
                info!(bot_id = %info.bot_id, "Bot is alive again");
            }
        }
        heartbeats.insert(info.bot_id.clone(), info);
    }

    /// Re-grade every heartbeat by age. Returns bots whose status changed.
    pub async fn sweep_liveness(&self) -> Vec<(String, BotStatus)> {
        let now = Utc::now();
        let inactive_after = self.config.inactive_after();
        let dead_after = self.config.dead_after();

        let mut changed = Vec::new();
        let mut heartbeats = self.heartbeats.write().await;
        for (bot_id, info) in heartbeats.iter_mut() {
            let age = now.signed_duration_since(info.last_seen);
            let status = if age > dead_after {
                BotStatus::Dead
            } else if age > inactive_after {
                BotStatus::Inactive
            } else {
                BotStatus::Active
            };

            if status != info.status {
                warn!(
                    bot_id = %bot_id,
                    from = %info.status,
                    to = %status,
                    last_seen = %info.last_seen,
                    "Bot liveness changed"
                );
                info.status = status;
                changed.push((bot_id.clone(), status));
            }
        }
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }

    pub async fn heartbeats(&self) -> Vec<HeartbeatInfo> {
        let mut all: Vec<HeartbeatInfo> = self.heartbeats.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        all
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read().await
    }

    /// Running, and synced within the staleness bound.
    pub async fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match *self.last_sync.read().await {
            Some(at) => Utc::now().signed_duration_since(at) <= self.config.stale_sync_window(),
            None => false,
        }
    }

    pub async fn register_bot(&self, bot_id: &str, config: BotConfig) -> Result<BotAllocation> {
        let symbol = config.symbol.clone();
        let alloc = self.portfolio.register_bot(bot_id, config).await?;
        self.broadcast(SyncEvent::new(
            EventType::Register,
            bot_id,
            alloc.allocated_balance,
            format!("Registered for {}", symbol),
        ))
        .await;
        Ok(alloc)
    }

    pub async fn unregister_bot(&self, bot_id: &str) -> Result<BotAllocation> {
        let alloc = self.portfolio.unregister_bot(bot_id).await?;
        self.broadcast(SyncEvent::new(
            EventType::Unregister,
            bot_id,
            alloc.allocated_balance,
            "Unregistered",
        ))
        .await;
        Ok(alloc)
    }

    pub async fn update_position(
        &self,
        bot_id: &str,
        position_value: Decimal,
        avg_price: Decimal,
        leverage: Decimal,
    ) -> Result<BotAllocation> {
        let alloc = self
            .portfolio
            .update_position(bot_id, position_value, avg_price, leverage)
            .await?;
        self.broadcast(SyncEvent::new(
            EventType::PositionUpdate,
            bot_id,
            position_value,
            format!("Position {} @ {} ({}x)", position_value, avg_price, alloc.leverage),
        ))
        .await;
        Ok(alloc)
    }

    pub async fn record_profit(
        &self,
        bot_id: &str,
        profit: Decimal,
        share_profit: bool,
    ) -> Result<HashMap<String, Decimal>> {
        let shares = self.portfolio.record_profit(bot_id, profit, share_profit).await?;

        self.broadcast(SyncEvent::new(
            EventType::ProfitRecord,
            bot_id,
            profit,
            format!("Recorded profit {}", profit),
        ))
        .await;

        let mut recipients: Vec<(&String, &Decimal)> = shares.iter().collect();
        recipients.sort();
        for (recipient, share) in recipients {
            self.broadcast(SyncEvent::new(
                EventType::ProfitShare,
                recipient.as_str(),
                *share,
                format!("Share of profit from {}", bot_id),
            ))
            .await;
        }

        Ok(shares)
    }

    pub async fn trigger_rebalance(&self) -> Result<Vec<RebalanceAdjustment>> {
        let adjustments = self.portfolio.rebalance().await?;
        for adjustment in &adjustments {
            self.broadcast(SyncEvent::new(
                EventType::Rebalance,
                adjustment.bot_id.as_str(),
                adjustment.after - adjustment.before,
                format!("Rebalanced {} -> {}", adjustment.before, adjustment.after),
            ))
            .await;
        }
        Ok(adjustments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortfolioError;
    use crate::models::PortfolioConfig;
    use crate::state::FileStateStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct RecordingHandler {
        events: std::sync::Mutex<Vec<SyncEvent>>,
    }

    impl RecordingHandler {
        fn event_types(&self) -> Vec<EventType> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.event_type)
                .collect()
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle_event(&self, event: &SyncEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle_event(&self, _event: &SyncEvent) -> Result<()> {
            Err(PortfolioError::ConfigurationInvalid("notifier offline".to_string()))
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            heartbeat_interval: Duration::from_millis(20),
            sync_interval: Duration::from_millis(20),
            lock_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn make_sync(dir: &TempDir, config: SyncConfig) -> Arc<SyncManager> {
        let store = Arc::new(FileStateStore::new(dir.path().join("portfolio.json")));
        let portfolio = Arc::new(PortfolioManager::new(
            PortfolioConfig {
                total_balance: dec!(1000),
                ..Default::default()
            },
            store,
        ));
        portfolio.initialize().await.unwrap();
        Arc::new(SyncManager::new("bot-a", portfolio, config))
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let sync = make_sync(&dir, fast_config()).await;
        assert!(!sync.is_healthy().await);

        sync.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sync.is_running());
        assert!(sync.is_healthy().await);
        assert!(sync.last_sync().await.is_some());

        let heartbeats = sync.heartbeats().await;
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(heartbeats[0].status, BotStatus::Active);

        sync.stop().await;
        assert!(!sync.is_running());
        assert!(!sync.is_healthy().await);
    }

    #[tokio::test]
    async fn test_mutations_reach_handlers_despite_failures() {
        let dir = TempDir::new().unwrap();
        let sync = make_sync(&dir, fast_config()).await;
        let recorder = Arc::new(RecordingHandler::default());
        sync.add_handler(Arc::new(FailingHandler)).await;
        sync.add_handler(recorder.clone()).await;

        assert_ok!(
            sync.register_bot("bot-a", BotConfig::new("BTCUSDT", dec!(10), dec!(0.5)))
                .await
        );
        assert_ok!(
            sync.update_position("bot-a", dec!(1000), dec!(50000), dec!(10))
                .await
        );
        assert_ok!(sync.record_profit("bot-a", dec!(10), true).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            recorder.event_types(),
            vec![
                EventType::Register,
                EventType::PositionUpdate,
                EventType::ProfitRecord,
                EventType::ProfitShare,
            ]
        );
    }

    #[tokio::test]
    async fn test_rebalance_and_unregister_are_broadcast() {
        let dir = TempDir::new().unwrap();
        let sync = make_sync(&dir, fast_config()).await;
        let recorder = Arc::new(RecordingHandler::default());
        sync.add_handler(recorder.clone()).await;

        sync.register_bot("bot-a", BotConfig::new("BTCUSDT", dec!(10), dec!(0.8)))
            .await
            .unwrap();
        sync.register_bot("bot-b", BotConfig::new("ETHUSDT", dec!(5), dec!(0.2)))
            .await
            .unwrap();
        // Equal split: a 1300 / 2000, b 700 / 2000
        sync.record_profit("bot-b", dec!(1000), true).await.unwrap();

        let adjustments = sync.trigger_rebalance().await.unwrap();
        assert_eq!(adjustments.len(), 2);
        assert_eq!(adjustments[0].bot_id, "bot-b");
        assert_eq!(adjustments[0].after, dec!(400));
        assert_eq!(adjustments[1].bot_id, "bot-a");
        assert_eq!(adjustments[1].after, dec!(1600));

        let released = sync.unregister_bot("bot-b").await.unwrap();
        assert_eq!(released.allocated_balance, dec!(400));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            recorder.event_types(),
            vec![
                EventType::Register,
                EventType::Register,
                EventType::ProfitRecord,
                EventType::ProfitShare,
                EventType::ProfitShare,
                EventType::Rebalance,
                EventType::Rebalance,
                EventType::Unregister,
            ]
        );

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events[5].bot_id, "bot-b");
        assert_eq!(events[5].amount, dec!(-300));
        assert_eq!(events[6].amount, dec!(300));
        assert_eq!(events[7].bot_id, "bot-b");
        assert_eq!(events[7].amount, dec!(400));

        let persisted = sync.portfolio().store().load().await.unwrap();
        assert_eq!(persisted.allocations.len(), 1);
        assert_ok!(persisted.validate_invariants());
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_broadcast() {
        let dir = TempDir::new().unwrap();
        let sync = make_sync(&dir, fast_config()).await;
        let recorder = Arc::new(RecordingHandler::default());
        sync.add_handler(recorder.clone()).await;

        assert!(sync
            .update_position("ghost", dec!(100), dec!(1), dec!(10))
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.event_types().is_empty());
    }

    #[tokio::test]
    async fn test_liveness_sweep() {
        let dir = TempDir::new().unwrap();
        let sync = make_sync(&dir, SyncConfig::default()).await;

        let mut quiet = HeartbeatInfo::local("bot-b");
        sync.record_heartbeat(quiet.clone()).await;
        quiet.last_seen = Utc::now() - chrono::Duration::seconds(35);
        sync.heartbeats.write().await.insert("bot-b".to_string(), quiet.clone());

        let mut gone = HeartbeatInfo::local("bot-c");
        gone.last_seen = Utc::now() - chrono::Duration::seconds(70);
        sync.heartbeats.write().await.insert("bot-c".to_string(), gone);

        let changed = sync.sweep_liveness().await;
        assert_eq!(
            changed,
            vec![
                ("bot-b".to_string(), BotStatus::Inactive),
                ("bot-c".to_string(), BotStatus::Dead),
            ]
        );

        // A fresh heartbeat revives the bot
        sync.record_heartbeat(HeartbeatInfo::local("bot-b")).await;
        let heartbeats = sync.heartbeats().await;
        assert_eq!(heartbeats[0].status, BotStatus::Active);
        assert_eq!(heartbeats[1].status, BotStatus::Dead);
    }

    #[tokio::test]
    async fn test_sync_picks_up_remote_changes() {
        let dir = TempDir::new().unwrap();
        let sync = make_sync(&dir, fast_config()).await;

        let other = PortfolioManager::new(
            PortfolioConfig {
                total_balance: dec!(1000),
                ..Default::default()
            },
            Arc::new(FileStateStore::new(dir.path().join("portfolio.json"))),
        );
        other.initialize().await.unwrap();
        other
            .register_bot("bot-b", BotConfig::new("ETHUSDT", dec!(5), dec!(0.3)))
            .await
            .unwrap();

        assert!(sync.portfolio().get_allocation("bot-b").await.is_none());
        assert!(sync.sync_once().await.unwrap());
        assert!(sync.portfolio().get_allocation("bot-b").await.is_some());
        assert!(!sync.sync_once().await.unwrap());
    }
}
