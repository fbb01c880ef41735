//! Capital allocation ledger and the per-process portfolio façade.

mod allocation;
mod health;
mod manager;

pub use allocation::{AllocationDrift, AllocationManager, RebalanceAdjustment, HISTORY_CAPACITY};
pub use health::{HealthStatus, PortfolioHealth, MARGIN_UTILIZATION_WARNING};
pub use manager::PortfolioManager;
