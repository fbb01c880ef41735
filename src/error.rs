//! Error taxonomy for portfolio coordination.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the shared-portfolio ledger, its persistence and sync layers.
#[derive(Error, Debug)]
pub enum PortfolioError {
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("insufficient margin for bot {bot_id}: required {required}, available {available}")]
    InsufficientMargin {
        bot_id: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("exceeds allocation for bot {bot_id}: requested {requested}, available {available}")]
    ExceedsAllocation {
        bot_id: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("risk limit exceeded for bot {bot_id}: {reason}")]
    ExceedsRiskLimit { bot_id: String, reason: String },

    #[error("bot not registered: {0}")]
    BotNotRegistered(String),

    #[error("bot already registered: {0}")]
    BotAlreadyRegistered(String),

    #[error("invalid leverage {leverage}: must be within [{min}, {max}]")]
    InvalidLeverage {
        leverage: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("portfolio locked by {holder} since {since}")]
    PortfolioLocked { holder: String, since: DateTime<Utc> },

    #[error("lock not acquired within {waited:?}")]
    LockTimeout { waited: Duration },

    #[error("portfolio state corrupted: {0}")]
    StateCorrupted(String),

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("bot {bot_id} still holds a position of {position}")]
    PositionStillOpen { bot_id: String, position: Decimal },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PortfolioError {
    /// Whether a caller may reasonably retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PortfolioError::PortfolioLocked { .. } | PortfolioError::LockTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PortfolioError>;
