//! Portfolio health assessment.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{BotAllocation, PortfolioConfig};

/// Per-bot margin utilization above which a warning is raised.
pub const MARGIN_UTILIZATION_WARNING: Decimal = dec!(0.9);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot of portfolio health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioHealth {
    pub status: HealthStatus,
    pub total_balance: Decimal,
    pub total_allocated: Decimal,
    pub total_exposure: Decimal,
    pub total_margin_used: Decimal,
    /// Realized plus unrealized
    pub total_pnl: Decimal,
    /// Exposure as a percentage of total balance
    pub exposure_pct: Decimal,
    /// P&L as a percentage of total balance
    pub pnl_pct: Decimal,
    pub bot_count: usize,
    pub emergency_stop: bool,
    pub warnings: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl PortfolioHealth {
    /// Grade exposure, drawdown and per-bot margin utilization against policy.
    pub fn assess<'a>(
        allocations: impl IntoIterator<Item = &'a BotAllocation>,
        total_balance: Decimal,
        total_profit: Decimal,
        config: &PortfolioConfig,
    ) -> Self {
        let mut status = HealthStatus::Healthy;
        let mut warnings = Vec::new();
        let mut total_allocated = Decimal::ZERO;
        let mut total_exposure = Decimal::ZERO;
        let mut total_margin_used = Decimal::ZERO;
        let mut unrealized = Decimal::ZERO;
        let mut bot_count = 0;

        let mut bots: Vec<&BotAllocation> = allocations.into_iter().collect();
        bots.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));

        for alloc in bots {
            bot_count += 1;
            total_allocated += alloc.allocated_balance;
            total_exposure += alloc.current_position;
            total_margin_used += alloc.position_margin_used;
            unrealized += alloc.unrealized_pnl;

            let utilization = alloc.margin_utilization();
            if utilization > MARGIN_UTILIZATION_WARNING {
                status = status.max(HealthStatus::Warning);
                warnings.push(format!(
                    "bot {} margin utilization {:.1}%",
                    alloc.bot_id,
                    utilization * Decimal::ONE_HUNDRED
                ));
            }
        }

        let total_pnl = total_profit + unrealized;
        let (exposure_pct, pnl_pct) = if total_balance > Decimal::ZERO {
            (
                total_exposure / total_balance * Decimal::ONE_HUNDRED,
                total_pnl / total_balance * Decimal::ONE_HUNDRED,
            )
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };

        let exposure_limit = config.max_total_exposure * Decimal::ONE_HUNDRED;
        if exposure_pct > exposure_limit {
            status = HealthStatus::Critical;
            warnings.push(format!(
                "exposure {:.1}% above limit {:.1}%",
                exposure_pct, exposure_limit
            ));
        } else if exposure_pct > exposure_limit * dec!(0.8) {
            status = status.max(HealthStatus::Warning);
            warnings.push(format!(
                "exposure {:.1}% approaching limit {:.1}%",
                exposure_pct, exposure_limit
            ));
        }

        let drawdown_limit = -config.max_drawdown_percent;
        if pnl_pct < drawdown_limit {
            status = HealthStatus::Critical;
            warnings.push(format!(
                "P&L {:.1}% below max drawdown {:.1}%",
                pnl_pct, drawdown_limit
            ));
        } else if pnl_pct < drawdown_limit / dec!(2) {
            status = status.max(HealthStatus::Warning);
            warnings.push(format!("P&L {:.1}% in drawdown", pnl_pct));
        }

        Self {
            status,
            total_balance,
            total_allocated,
            total_exposure,
            total_margin_used,
            total_pnl,
            exposure_pct,
            pnl_pct,
            bot_count,
            emergency_stop: false,
            warnings,
            checked_at: Utc::now(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.status == HealthStatus::Critical
    }
}
