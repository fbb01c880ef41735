//! Risk policy: leverage caps, exposure ratios, per-bot limits and metrics.

mod manager;

pub use manager::{RiskManager, RiskMetrics};
