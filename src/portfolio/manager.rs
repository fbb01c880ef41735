//! Portfolio manager: the per-process façade over ledger, risk and storage.
//!
//! Every mutation runs as a transaction against the shared state file:
//! lock, reload the authoritative state, apply the change locally, save
//! with a bumped version, unlock. A failed save rolls the local ledger
//! back to the reloaded snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{AllocationDrift, AllocationManager, PortfolioHealth, RebalanceAdjustment};
use crate::error::{PortfolioError, Result};
use crate::leverage::{PositionSafety, PositionSide, PositionSnapshot};
use crate::models::{AllocationEvent, BotAllocation, BotConfig, PortfolioConfig, PortfolioState};
use crate::risk::{RiskManager, RiskMetrics};
use crate::state::{LockHandle, StateStore, DEFAULT_LOCK_TIMEOUT};

/// Shared-balance portfolio as seen by one bot process.
pub struct PortfolioManager {
    allocations: Arc<AllocationManager>,
    risk: RwLock<RiskManager>,
    store: Arc<dyn StateStore>,
    lock_timeout: Duration,

    // Bot configs registered through this process
    bot_configs: RwLock<HashMap<String, BotConfig>>,

    // Highest equity observed, for drawdown-from-peak
    peak_equity: RwLock<Decimal>,

    emergency_stop: AtomicBool,
    closed: AtomicBool,
}

impl PortfolioManager {
    pub fn new(config: PortfolioConfig, store: Arc<dyn StateStore>) -> Self {
        let peak = config.total_balance;
        Self {
            risk: RwLock::new(RiskManager::from_config(&config)),
            allocations: Arc::new(AllocationManager::new(config)),
            store,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            bot_configs: RwLock::new(HashMap::new()),
            peak_equity: RwLock::new(peak),
            emergency_stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn allocation_manager(&self) -> &Arc<AllocationManager> {
        &self.allocations
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Validate config, then load the shared state or create it.
    pub async fn initialize(&self) -> Result<()> {
        let config = self.allocations.config().await;
        config.validate()?;

        let handle = self.store.lock_with_timeout(self.lock_timeout).await?;
        let result = async {
            if self.store.exists().await {
                let state = self.store.load().await?;
                self.allocations.load_state(&state).await?;
                info!(
                    version = state.version,
                    bots = state.allocations.len(),
                    total_balance = %state.total_balance,
                    "Joined existing portfolio"
                );
            } else {
                let mut state = self.allocations.export_state().await;
                state.version += 1;
                self.store.save(&state).await?;
                self.allocations.mark_persisted(state.version).await;
                info!(total_balance = %state.total_balance, "Created new portfolio state");
            }
            Ok::<_, PortfolioError>(())
        }
        .await;
        self.release(handle).await;

        result?;
        self.observe_equity().await;
        Ok(())
    }

    /// Run `op` against the ledger inside a locked reload/save cycle.
    async fn transact<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<AllocationManager>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.store.lock_with_timeout(self.lock_timeout).await?;

        let result = async {
            if self.store.exists().await {
                let remote = self.store.load().await?;
                self.allocations.load_state(&remote).await?;
            }
            let snapshot = self.allocations.export_state().await;

            let value = op(Arc::clone(&self.allocations)).await?;

            let mut state = self.allocations.export_state().await;
            state.version = snapshot.version + 1;
            if let Err(e) = self.store.save(&state).await {
                error!(error = %e, "Failed to persist portfolio state, rolling back");
                self.rollback(&snapshot).await;
                return Err(e);
            }
            self.allocations.mark_persisted(state.version).await;
            debug!(version = state.version, "Persisted portfolio state");

            Ok::<_, PortfolioError>(value)
        }
        .await;

        self.release(handle).await;
        result
    }

    async fn rollback(&self, snapshot: &PortfolioState) {
        if let Err(e) = self.allocations.load_state(snapshot).await {
            error!(error = %e, "Rollback to pre-mutation snapshot failed");
        }
    }

    async fn release(&self, handle: LockHandle) {
        if let Err(e) = self.store.unlock(handle).await {
            warn!(error = %e, "Failed to release portfolio lock");
        }
    }

    /// Register a bot and persist its allocation.
    pub async fn register_bot(&self, bot_id: &str, config: BotConfig) -> Result<BotAllocation> {
        let alloc = self
            .transact(|am| {
                let config = config.clone();
                async move { am.allocate_to_bot(bot_id, &config).await }
            })
            .await?;

        self.bot_configs
            .write()
            .await
            .insert(bot_id.to_string(), config);
        info!(bot_id = %bot_id, allocated = %alloc.allocated_balance, "Registered bot");
        Ok(alloc)
    }

    pub async fn unregister_bot(&self, bot_id: &str) -> Result<BotAllocation> {
        let alloc = self
            .transact(|am| async move { am.deallocate_from_bot(bot_id).await })
            .await?;

        self.bot_configs.write().await.remove(bot_id);
        info!(bot_id = %bot_id, released = %alloc.allocated_balance, "Unregistered bot");
        Ok(alloc)
    }

    /// Report a bot's current position. A zero value closes it.
    pub async fn update_position(
        &self,
        bot_id: &str,
        position_value: Decimal,
        avg_price: Decimal,
        leverage: Decimal,
    ) -> Result<BotAllocation> {
        let risk = self.risk.read().await.clone();
        if !position_value.is_zero() {
            risk.validate_position(bot_id, position_value, leverage)?;
        }

        if let Some(bot_config) = self.bot_configs.read().await.get(bot_id) {
            if bot_config.max_position_size > Decimal::ZERO
                && position_value > bot_config.max_position_size
            {
                return Err(PortfolioError::ExceedsRiskLimit {
                    bot_id: bot_id.to_string(),
                    reason: format!(
                        "position {} above bot max {}",
                        position_value, bot_config.max_position_size
                    ),
                });
            }
        }

        let stopped = self.is_emergency_stopped();
        let alloc = self
            .transact(|am| async move {
                let current = am
                    .get_allocation(bot_id)
                    .await
                    .ok_or_else(|| PortfolioError::BotNotRegistered(bot_id.to_string()))?;

                let margin = am.calculator().required_margin(position_value, leverage);
                risk.validate_margin(bot_id, margin, current.allocated_balance)?;

                if position_value > current.current_position {
                    if stopped {
                        return Err(PortfolioError::ExceedsRiskLimit {
                            bot_id: bot_id.to_string(),
                            reason: "emergency stop active, only reductions allowed".to_string(),
                        });
                    }

                    let total_balance = am.total_balance().await;
                    risk.check_bot_risk(bot_id, margin, total_balance)?;

                    let exposure =
                        am.total_exposure().await - current.current_position + position_value;
                    if !risk.is_within_risk_limits(exposure, total_balance) {
                        return Err(PortfolioError::ExceedsRiskLimit {
                            bot_id: bot_id.to_string(),
                            reason: format!(
                                "total exposure {} above {}x of balance {}",
                                exposure,
                                risk.max_total_exposure(),
                                total_balance
                            ),
                        });
                    }
                }

                am.update_bot_position(bot_id, position_value, avg_price, leverage)
                    .await
            })
            .await?;

        self.get_portfolio_health().await;
        Ok(alloc)
    }

    pub async fn update_unrealized_pnl(&self, bot_id: &str, pnl: Decimal) -> Result<()> {
        self.transact(|am| async move { am.update_unrealized_pnl(bot_id, pnl).await })
            .await?;
        self.observe_equity().await;
        Ok(())
    }

    /// Book realized profit, optionally sharing it across the pool.
    pub async fn record_profit(
        &self,
        bot_id: &str,
        profit: Decimal,
        share_profit: bool,
    ) -> Result<HashMap<String, Decimal>> {
        let shares = self
            .transact(|am| async move { am.record_profit(bot_id, profit, share_profit).await })
            .await?;
        self.get_portfolio_health().await;
        Ok(shares)
    }

    pub async fn check_rebalance_needed(&self) -> Result<Vec<AllocationDrift>> {
        self.allocations.check_rebalance_needed().await
    }

    pub async fn rebalance(&self) -> Result<Vec<RebalanceAdjustment>> {
        self.transact(|am| async move { am.execute_rebalance().await })
            .await
    }

    /// Deposit or withdraw pool capital.
    pub async fn adjust_total_balance(&self, delta: Decimal) -> Result<Decimal> {
        let total = self
            .transact(|am| async move { am.adjust_total_balance(delta).await })
            .await?;
        self.observe_equity().await;
        Ok(total)
    }

    /// Replace the local ledger with the persisted state. Returns whether
    /// the version moved.
    pub async fn sync_from_store(&self) -> Result<bool> {
        self.sync_with_timeout(self.lock_timeout).await
    }

    pub async fn sync_with_timeout(&self, lock_timeout: Duration) -> Result<bool> {
        let handle = self.store.lock_with_timeout(lock_timeout).await?;
        let result = async {
            let remote = self.store.load().await?;
            let local_version = self.allocations.version().await;
            self.allocations.load_state(&remote).await?;
            Ok::<_, PortfolioError>(remote.version != local_version)
        }
        .await;
        self.release(handle).await;

        let changed = result?;
        if changed {
            let version = self.allocations.version().await;
            debug!(version, "Merged remote portfolio state");
        }
        Ok(changed)
    }

    /// Swap policy parameters and rebuild the risk manager.
    pub async fn reconfigure(&self, config: PortfolioConfig) -> Result<()> {
        self.allocations.reconfigure(config.clone()).await?;
        *self.risk.write().await = RiskManager::from_config(&config);
        Ok(())
    }

    pub async fn config(&self) -> PortfolioConfig {
        self.allocations.config().await
    }

    pub async fn get_allocation(&self, bot_id: &str) -> Option<BotAllocation> {
        self.allocations.get_allocation(bot_id).await
    }

    pub async fn get_all_allocations(&self) -> HashMap<String, BotAllocation> {
        self.allocations.get_all_allocations().await
    }

    pub async fn total_balance(&self) -> Decimal {
        self.allocations.total_balance().await
    }

    pub async fn total_profit(&self) -> Decimal {
        self.allocations.total_profit().await
    }

    /// Pool capital not assigned to any bot.
    pub async fn available_balance(&self) -> Decimal {
        self.allocations.unallocated_balance().await
    }

    pub async fn total_margin_used(&self) -> Decimal {
        self.allocations.total_margin_used().await
    }

    pub async fn total_exposure(&self) -> Decimal {
        self.allocations.total_exposure().await
    }

    pub async fn bot_available_balance(&self, bot_id: &str) -> Result<Decimal> {
        self.allocations
            .get_allocation(bot_id)
            .await
            .map(|a| a.available_balance)
            .ok_or_else(|| PortfolioError::BotNotRegistered(bot_id.to_string()))
    }

    /// Largest notional the bot's whole allocation can carry at its
    /// leverage, capped by the bot's configured maximum.
    pub async fn max_position_size(&self, bot_id: &str) -> Result<Decimal> {
        let alloc = self
            .allocations
            .get_allocation(bot_id)
            .await
            .ok_or_else(|| PortfolioError::BotNotRegistered(bot_id.to_string()))?;

        let mut max = self
            .allocations
            .calculator()
            .max_position_size(alloc.allocated_balance, alloc.leverage);
        if let Some(config) = self.bot_configs.read().await.get(bot_id) {
            if config.max_position_size > Decimal::ZERO {
                max = max.min(config.max_position_size);
            }
        }
        Ok(max)
    }

    /// Rate a bot's open position against the current market price.
    pub async fn position_safety(
        &self,
        bot_id: &str,
        current_price: Decimal,
        side: PositionSide,
    ) -> Result<PositionSafety> {
        let alloc = self
            .allocations
            .get_allocation(bot_id)
            .await
            .ok_or_else(|| PortfolioError::BotNotRegistered(bot_id.to_string()))?;

        let snapshot = PositionSnapshot {
            position_value: alloc.current_position,
            margin_used: alloc.position_margin_used,
            allocated_balance: alloc.allocated_balance,
            entry_price: alloc.average_price,
            current_price,
            leverage: alloc.leverage,
            side,
        };
        Ok(self.allocations.calculator().assess_position_safety(&snapshot))
    }

    pub async fn allocation_history(&self, limit: usize) -> Vec<AllocationEvent> {
        self.allocations.get_allocation_history(limit).await
    }

    pub async fn version(&self) -> u64 {
        self.allocations.version().await
    }

    pub async fn risk_metrics(&self) -> RiskMetrics {
        let peak = self.observe_equity().await;
        let allocations = self.allocations.get_all_allocations().await;
        let total_balance = self.allocations.total_balance().await;
        self.risk
            .read()
            .await
            .calculate_metrics(allocations.values(), total_balance, peak)
    }

    /// Grade the portfolio; trips the emergency stop on critical health
    /// when enabled.
    pub async fn get_portfolio_health(&self) -> PortfolioHealth {
        self.observe_equity().await;
        let config = self.allocations.config().await;
        let allocations = self.allocations.get_all_allocations().await;
        let total_balance = self.allocations.total_balance().await;
        let total_profit = self.allocations.total_profit().await;

        let mut health =
            PortfolioHealth::assess(allocations.values(), total_balance, total_profit, &config);

        if config.emergency_stop_enabled
            && health.is_critical()
            && !self.emergency_stop.swap(true, Ordering::SeqCst)
        {
            error!(warnings = ?health.warnings, "Portfolio critical, emergency stop engaged");
        }
        health.emergency_stop = self.is_emergency_stopped();
        health
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    pub fn reset_emergency_stop(&self) {
        if self.emergency_stop.swap(false, Ordering::SeqCst) {
            info!("Emergency stop reset");
        }
    }

    /// Update and return peak equity.
    async fn observe_equity(&self) -> Decimal {
        let allocations = self.allocations.get_all_allocations().await;
        let unrealized: Decimal = allocations.values().map(|a| a.unrealized_pnl).sum();
        let equity = self.allocations.total_balance().await + unrealized;

        let mut peak = self.peak_equity.write().await;
        if equity > *peak {
            *peak = equity;
        }
        *peak
    }

    pub async fn backup(&self) -> Result<PathBuf> {
        let path = self.store.backup_state().await?;
        info!(path = %path.display(), "Backed up portfolio state");
        Ok(path)
    }

    /// Restore a backup and reload it into the local ledger.
    pub async fn restore(&self, backup: &Path) -> Result<()> {
        let handle = self.store.lock_with_timeout(self.lock_timeout).await?;
        let result = async {
            self.store.restore_from_backup(backup).await?;
            let state = self.store.load().await?;
            self.allocations.load_state(&state).await
        }
        .await;
        self.release(handle).await;

        result?;
        info!(path = %backup.display(), "Restored portfolio state");
        Ok(())
    }

    pub async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        self.store.list_backups().await
    }

    /// Best-effort final save. Remote changes are merged first, so a
    /// closing process never overwrites another process's commits.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.transact(|_| async { Ok::<_, PortfolioError>(()) }).await {
            Ok(()) => {
                let version = self.allocations.version().await;
                info!(version, "Portfolio closed");
            }
            Err(e) => warn!(error = %e, "Final save failed"),
        }
    }
}
