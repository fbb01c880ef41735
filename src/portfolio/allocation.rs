//! Allocation manager: the in-process authority over the shared ledger.
//!
//! All state lives behind one `RwLock`; writers are exclusive, readers
//! shared, and every accessor hands out copies.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{PortfolioError, Result};
use crate::leverage::LeverageCalculator;
use crate::models::{
    AllocationEvent, AllocationStrategy, BotAllocation, BotConfig, EventType, PortfolioConfig,
    PortfolioState,
};

/// Events retained in the in-memory history ring.
pub const HISTORY_CAPACITY: usize = 10_000;

/// A bot whose share of the pool has drifted from its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationDrift {
    pub bot_id: String,
    pub current_share: Decimal,
    pub target_share: Decimal,
    /// `current_share - target_share`
    pub drift: Decimal,
}

/// One allocation changed by a rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceAdjustment {
    pub bot_id: String,
    pub before: Decimal,
    pub after: Decimal,
}

struct Ledger {
    config: PortfolioConfig,
    total_balance: Decimal,
    total_profit: Decimal,
    allocations: HashMap<String, BotAllocation>,
    version: u64,
    last_rebalance: DateTime<Utc>,
    history: VecDeque<AllocationEvent>,
}

impl Ledger {
    fn total_allocated(&self) -> Decimal {
        self.allocations.values().map(|a| a.allocated_balance).sum()
    }

    fn record(&mut self, event: AllocationEvent) {
        debug!(
            event = %event.event_type,
            bot_id = %event.bot_id,
            amount = %event.amount,
            "{}",
            event.description
        );
        self.history.push_back(event);
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    fn bot_mut(&mut self, bot_id: &str) -> Result<&mut BotAllocation> {
        self.allocations
            .get_mut(bot_id)
            .ok_or_else(|| PortfolioError::BotNotRegistered(bot_id.to_string()))
    }

    /// Spread `profit` over the ledger per the configured strategy and
    /// grow the pool by the full amount. Returns each recipient's share.
    fn share_profit(&mut self, source_bot: &str, profit: Decimal) -> HashMap<String, Decimal> {
        let mut bot_ids: Vec<String> = self.allocations.keys().cloned().collect();
        bot_ids.sort();

        let weights: Vec<(String, Decimal)> = match self.config.allocation_strategy {
            AllocationStrategy::EqualWeight => equal_weights(&bot_ids),
            AllocationStrategy::PerformanceBased => {
                let positive: Vec<(String, Decimal)> = bot_ids
                    .iter()
                    .filter_map(|id| {
                        let pnl = self.allocations[id].realized_pnl;
                        (pnl > Decimal::ZERO).then(|| (id.clone(), pnl))
                    })
                    .collect();
                let total_positive: Decimal = positive.iter().map(|(_, pnl)| *pnl).sum();

                if total_positive.is_zero() {
                    debug!("No bot with positive P&L, falling back to equal weight");
                    equal_weights(&bot_ids)
                } else {
                    positive
                        .into_iter()
                        .map(|(id, pnl)| (id, pnl / total_positive))
                        .collect()
                }
            }
            AllocationStrategy::Custom => vec![(source_bot.to_string(), Decimal::ONE)],
        };

        let shares = split_exactly(profit, &weights);

        for (bot_id, share) in &shares {
            let Some(alloc) = self.allocations.get_mut(bot_id) else {
                continue;
            };
            let before = alloc.clone();
            alloc.allocated_balance += *share;
            alloc.recompute_balances();
            let after = alloc.clone();

            self.record(
                AllocationEvent::new(
                    EventType::ProfitShare,
                    bot_id.clone(),
                    *share,
                    format!("Received {} of profit from {}", share, source_bot),
                )
                .with_snapshots(Some(before), Some(after)),
            );
        }

        // Literal capital growth: the pool grows by the full shared profit
        self.total_balance += profit;

        shares
    }
}

fn equal_weights(bot_ids: &[String]) -> Vec<(String, Decimal)> {
    if bot_ids.is_empty() {
        return Vec::new();
    }
    let weight = Decimal::ONE / Decimal::from(bot_ids.len());
    bot_ids.iter().map(|id| (id.clone(), weight)).collect()
}

/// Split `amount` by weight; the last recipient absorbs rounding so the
/// shares sum to exactly `amount`.
fn split_exactly(amount: Decimal, weights: &[(String, Decimal)]) -> HashMap<String, Decimal> {
    let mut shares = HashMap::new();
    let mut distributed = Decimal::ZERO;

    for (i, (bot_id, weight)) in weights.iter().enumerate() {
        let share = if i + 1 == weights.len() {
            amount - distributed
        } else {
            amount * *weight
        };
        distributed += share;
        shares.insert(bot_id.clone(), share);
    }

    shares
}

/// In-process ledger of per-bot allocations drawn from one capital pool.
pub struct AllocationManager {
    calculator: LeverageCalculator,
    ledger: RwLock<Ledger>,
}

impl AllocationManager {
    pub fn new(config: PortfolioConfig) -> Self {
        Self::with_calculator(config, LeverageCalculator::default())
    }

    pub fn with_calculator(config: PortfolioConfig, calculator: LeverageCalculator) -> Self {
        let ledger = Ledger {
            total_balance: config.total_balance,
            total_profit: Decimal::ZERO,
            allocations: HashMap::new(),
            version: 0,
            last_rebalance: Utc::now(),
            history: VecDeque::new(),
            config,
        };
        Self {
            calculator,
            ledger: RwLock::new(ledger),
        }
    }

    pub fn calculator(&self) -> &LeverageCalculator {
        &self.calculator
    }

    /// Carve `total_balance * allocation_percentage` out of the pool for a bot.
    pub async fn allocate_to_bot(&self, bot_id: &str, config: &BotConfig) -> Result<BotAllocation> {
        if bot_id.trim().is_empty() {
            return Err(PortfolioError::ConfigurationInvalid(
                "bot id must not be empty".to_string(),
            ));
        }
        config.validate()?;

        let mut ledger = self.ledger.write().await;

        if ledger.allocations.contains_key(bot_id) {
            return Err(PortfolioError::BotAlreadyRegistered(bot_id.to_string()));
        }

        let amount = ledger.total_balance * config.allocation_percentage;
        let allocated = ledger.total_allocated();
        if allocated + amount > ledger.total_balance {
            return Err(PortfolioError::ExceedsAllocation {
                bot_id: bot_id.to_string(),
                requested: amount,
                available: ledger.total_balance - allocated,
            });
        }

        let allocation = BotAllocation::new(
            bot_id.to_string(),
            config.symbol.clone(),
            amount,
            config.leverage,
            config.allocation_percentage,
        );
        ledger.allocations.insert(bot_id.to_string(), allocation.clone());
        ledger.record(
            AllocationEvent::new(
                EventType::Allocate,
                bot_id,
                amount,
                format!(
                    "Allocated {} ({}% of pool) for {}",
                    amount,
                    config.allocation_percentage * Decimal::ONE_HUNDRED,
                    config.symbol
                ),
            )
            .with_snapshots(None, Some(allocation.clone())),
        );

        info!(
            bot_id = %bot_id,
            symbol = %config.symbol,
            amount = %amount,
            remaining = %(ledger.total_balance - allocated - amount),
            "Allocated capital to bot"
        );

        Ok(allocation)
    }

    /// Release a bot's allocation back to the pool. Refused while the bot
    /// holds a position.
    pub async fn deallocate_from_bot(&self, bot_id: &str) -> Result<BotAllocation> {
        let mut ledger = self.ledger.write().await;

        let alloc = ledger
            .allocations
            .get(bot_id)
            .ok_or_else(|| PortfolioError::BotNotRegistered(bot_id.to_string()))?;
        if alloc.has_open_position() {
            return Err(PortfolioError::PositionStillOpen {
                bot_id: bot_id.to_string(),
                position: alloc.current_position,
            });
        }

        let removed = ledger
            .allocations
            .remove(bot_id)
            .ok_or_else(|| PortfolioError::BotNotRegistered(bot_id.to_string()))?;
        ledger.record(
            AllocationEvent::new(
                EventType::Deallocate,
                bot_id,
                removed.allocated_balance,
                format!("Released {} back to pool", removed.allocated_balance),
            )
            .with_snapshots(Some(removed.clone()), None),
        );

        info!(bot_id = %bot_id, amount = %removed.allocated_balance, "Deallocated bot");
        Ok(removed)
    }

    /// Record a bot's open position and re-derive its margin usage.
    ///
    /// A zero `position_value` closes the position.
    pub async fn update_bot_position(
        &self,
        bot_id: &str,
        position_value: Decimal,
        avg_price: Decimal,
        leverage: Decimal,
    ) -> Result<BotAllocation> {
        if position_value < Decimal::ZERO {
            return Err(PortfolioError::ExceedsRiskLimit {
                bot_id: bot_id.to_string(),
                reason: format!("negative position value {}", position_value),
            });
        }
        if position_value > Decimal::ZERO {
            self.calculator.validate_leverage(leverage)?;
        }

        let margin = if position_value.is_zero() {
            Decimal::ZERO
        } else {
            self.calculator.required_margin(position_value, leverage)
        };

        let mut ledger = self.ledger.write().await;
        let alloc = ledger.bot_mut(bot_id)?;

        if margin > alloc.allocated_balance {
            return Err(PortfolioError::ExceedsAllocation {
                bot_id: bot_id.to_string(),
                requested: margin,
                available: alloc.allocated_balance,
            });
        }

        let before = alloc.clone();
        alloc.current_position = position_value;
        alloc.average_price = avg_price;
        if leverage > Decimal::ZERO {
            alloc.leverage = leverage;
        }
        alloc.apply_margin(margin);
        let after = alloc.clone();

        ledger.record(
            AllocationEvent::new(
                EventType::PositionUpdate,
                bot_id,
                position_value,
                format!(
                    "Position {} @ {} ({}x), margin {}",
                    position_value, avg_price, after.leverage, margin
                ),
            )
            .with_snapshots(Some(before), Some(after.clone())),
        );

        debug!(
            bot_id = %bot_id,
            position = %position_value,
            margin = %margin,
            available = %after.available_balance,
            "Updated bot position"
        );

        Ok(after)
    }

    pub async fn update_unrealized_pnl(&self, bot_id: &str, unrealized_pnl: Decimal) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let alloc = ledger.bot_mut(bot_id)?;
        alloc.unrealized_pnl = unrealized_pnl;
        alloc.last_updated = Utc::now();
        Ok(())
    }

    /// Book realized profit for a bot, optionally sharing positive profit
    /// across the pool. Returns each recipient's share (empty if not shared).
    pub async fn record_profit(
        &self,
        bot_id: &str,
        profit: Decimal,
        share_profit: bool,
    ) -> Result<HashMap<String, Decimal>> {
        let mut ledger = self.ledger.write().await;

        let alloc = ledger.bot_mut(bot_id)?;
        alloc.realized_pnl += profit;
        alloc.last_updated = Utc::now();
        let realized = alloc.realized_pnl;

        ledger.total_profit += profit;
        ledger.record(AllocationEvent::new(
            EventType::ProfitRecord,
            bot_id,
            profit,
            format!("Recorded profit {} (realized {})", profit, realized),
        ));

        info!(bot_id = %bot_id, profit = %profit, realized = %realized, "Recorded profit");

        if !share_profit || profit <= Decimal::ZERO {
            return Ok(HashMap::new());
        }

        let shares = ledger.share_profit(bot_id, profit);
        info!(
            bot_id = %bot_id,
            profit = %profit,
            strategy = %ledger.config.allocation_strategy,
            recipients = shares.len(),
            total_balance = %ledger.total_balance,
            "Shared profit across pool"
        );

        Ok(shares)
    }

    /// Bots drifting from their target share by more than the threshold.
    /// Empty until the rebalance interval has elapsed.
    pub async fn check_rebalance_needed(&self) -> Result<Vec<AllocationDrift>> {
        let ledger = self.ledger.read().await;

        let interval = ledger.config.rebalance_interval()?;
        if Utc::now() - ledger.last_rebalance < interval {
            return Ok(Vec::new());
        }
        if ledger.total_balance <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        let mut drifted: Vec<AllocationDrift> = ledger
            .allocations
            .values()
            .filter_map(|alloc| {
                let current_share = alloc.allocated_balance / ledger.total_balance;
                let drift = current_share - alloc.allocation_percentage;
                (drift.abs() > ledger.config.rebalance_threshold).then(|| AllocationDrift {
                    bot_id: alloc.bot_id.clone(),
                    current_share,
                    target_share: alloc.allocation_percentage,
                    drift,
                })
            })
            .collect();
        drifted.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));

        if !drifted.is_empty() {
            info!(count = drifted.len(), "Rebalance needed");
        }
        Ok(drifted)
    }

    /// Reset drifted allocations to their targets.
    ///
    /// Decreases are applied before increases so the pool is never
    /// over-committed; targets are scaled down if they sum past the pool,
    /// and a bot is never cut below the margin it has in use.
    pub async fn execute_rebalance(&self) -> Result<Vec<RebalanceAdjustment>> {
        let mut ledger = self.ledger.write().await;
        let total_balance = ledger.total_balance;
        let min_amount = ledger.config.min_rebalance_amount;

        let target_sum: Decimal = ledger
            .allocations
            .values()
            .map(|a| total_balance * a.allocation_percentage)
            .sum();
        let scale = if target_sum > total_balance && target_sum > Decimal::ZERO {
            warn!(
                targets = %target_sum,
                total_balance = %total_balance,
                "Rebalance targets exceed pool, scaling down"
            );
            total_balance / target_sum
        } else {
            Decimal::ONE
        };

        let mut plans: Vec<(String, Decimal)> = ledger
            .allocations
            .values()
            .filter_map(|a| {
                let target = total_balance * a.allocation_percentage * scale;
                ((target - a.allocated_balance).abs() > min_amount)
                    .then(|| (a.bot_id.clone(), target))
            })
            .collect();
        // Decreases first, then increases
        plans.sort_by(|(id_a, target_a), (id_b, target_b)| {
            let delta_a = *target_a - ledger.allocations[id_a].allocated_balance;
            let delta_b = *target_b - ledger.allocations[id_b].allocated_balance;
            delta_a.cmp(&delta_b).then_with(|| id_a.cmp(id_b))
        });

        let mut adjustments = Vec::new();
        for (bot_id, target) in plans {
            let headroom = ledger.total_balance - ledger.total_allocated();
            let Some(alloc) = ledger.allocations.get_mut(&bot_id) else {
                continue;
            };

            let mut new_balance = target;
            if new_balance < alloc.position_margin_used {
                warn!(
                    bot_id = %bot_id,
                    target = %target,
                    margin = %alloc.position_margin_used,
                    "Skipping rebalance below margin in use"
                );
                continue;
            }
            if new_balance > alloc.allocated_balance {
                let increase = (new_balance - alloc.allocated_balance).min(headroom.max(Decimal::ZERO));
                new_balance = alloc.allocated_balance + increase;
            }
            if new_balance == alloc.allocated_balance {
                continue;
            }

            let before = alloc.clone();
            alloc.allocated_balance = new_balance;
            alloc.recompute_balances();
            let after = alloc.clone();

            adjustments.push(RebalanceAdjustment {
                bot_id: bot_id.clone(),
                before: before.allocated_balance,
                after: after.allocated_balance,
            });
            ledger.record(
                AllocationEvent::new(
                    EventType::Rebalance,
                    bot_id.clone(),
                    after.allocated_balance - before.allocated_balance,
                    format!(
                        "Rebalanced {} -> {}",
                        before.allocated_balance, after.allocated_balance
                    ),
                )
                .with_snapshots(Some(before), Some(after)),
            );
        }

        ledger.last_rebalance = Utc::now();
        info!(adjusted = adjustments.len(), "Executed rebalance");

        Ok(adjustments)
    }

    /// Deposit (positive) or withdraw (negative) pool capital.
    pub async fn adjust_total_balance(&self, delta: Decimal) -> Result<Decimal> {
        let mut ledger = self.ledger.write().await;
        let new_total = ledger.total_balance + delta;
        let allocated = ledger.total_allocated();

        if new_total < allocated {
            return Err(PortfolioError::InsufficientBalance {
                required: allocated,
                available: new_total,
            });
        }

        ledger.total_balance = new_total;
        info!(delta = %delta, total_balance = %new_total, "Adjusted pool balance");
        Ok(new_total)
    }

    pub async fn get_allocation(&self, bot_id: &str) -> Option<BotAllocation> {
        self.ledger.read().await.allocations.get(bot_id).cloned()
    }

    pub async fn get_all_allocations(&self) -> HashMap<String, BotAllocation> {
        self.ledger.read().await.allocations.clone()
    }

    pub async fn is_registered(&self, bot_id: &str) -> bool {
        self.ledger.read().await.allocations.contains_key(bot_id)
    }

    pub async fn bot_count(&self) -> usize {
        self.ledger.read().await.allocations.len()
    }

    pub async fn total_balance(&self) -> Decimal {
        self.ledger.read().await.total_balance
    }

    pub async fn total_profit(&self) -> Decimal {
        self.ledger.read().await.total_profit
    }

    pub async fn total_allocated(&self) -> Decimal {
        self.ledger.read().await.total_allocated()
    }

    /// Pool capital not yet assigned to any bot.
    pub async fn unallocated_balance(&self) -> Decimal {
        let ledger = self.ledger.read().await;
        ledger.total_balance - ledger.total_allocated()
    }

    pub async fn total_margin_used(&self) -> Decimal {
        let ledger = self.ledger.read().await;
        ledger.allocations.values().map(|a| a.position_margin_used).sum()
    }

    pub async fn total_exposure(&self) -> Decimal {
        let ledger = self.ledger.read().await;
        ledger.allocations.values().map(|a| a.current_position).sum()
    }

    pub async fn version(&self) -> u64 {
        self.ledger.read().await.version
    }

    pub async fn config(&self) -> PortfolioConfig {
        self.ledger.read().await.config.clone()
    }

    /// Swap policy parameters; the pool balance is untouched.
    pub async fn reconfigure(&self, config: PortfolioConfig) -> Result<()> {
        config.validate()?;
        let mut ledger = self.ledger.write().await;
        info!(
            strategy = %config.allocation_strategy,
            "Reconfigured allocation policy"
        );
        ledger.config = config;
        Ok(())
    }

    /// Most recent events, oldest first.
    pub async fn get_allocation_history(&self, limit: usize) -> Vec<AllocationEvent> {
        let ledger = self.ledger.read().await;
        let skip = ledger.history.len().saturating_sub(limit);
        ledger.history.iter().skip(skip).cloned().collect()
    }

    /// Snapshot of the ledger in its persisted form.
    pub async fn export_state(&self) -> PortfolioState {
        let ledger = self.ledger.read().await;
        PortfolioState {
            total_balance: ledger.total_balance,
            total_profit: ledger.total_profit,
            last_updated: Utc::now(),
            allocations: ledger.allocations.clone(),
            global_settings: ledger.config.clone(),
            version: ledger.version,
            lock_holder: None,
            lock_time: None,
        }
    }

    /// Replace the ledger with an authoritative state. History and policy
    /// are kept.
    pub async fn load_state(&self, state: &PortfolioState) -> Result<()> {
        state.validate_structure()?;
        state.validate_invariants()?;

        let mut ledger = self.ledger.write().await;
        ledger.total_balance = state.total_balance;
        ledger.total_profit = state.total_profit;
        ledger.allocations = state.allocations.clone();
        ledger.version = state.version;

        debug!(
            version = state.version,
            bots = state.allocations.len(),
            "Loaded ledger from shared state"
        );
        Ok(())
    }

    pub async fn mark_persisted(&self, version: u64) {
        self.ledger.write().await.version = version;
    }

    /// Verify pool and per-bot balance invariants.
    pub async fn check_invariants(&self) -> Result<()> {
        let state = self.export_state().await;
        state.validate_invariants()?;
        for alloc in state.allocations.values() {
            if !alloc.balances_consistent() {
                return Err(PortfolioError::StateCorrupted(format!(
                    "inconsistent balances for bot {}",
                    alloc.bot_id
                )));
            }
        }
        Ok(())
    }
}
