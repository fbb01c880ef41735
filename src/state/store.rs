//! Persistence backend interface for the shared portfolio document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::LockHandle;
use crate::error::{PortfolioError, Result};
use crate::models::PortfolioState;

/// Default bounded wait for lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable, lockable storage of `PortfolioState`.
///
/// Locking is cooperative: writers are expected to hold the lock around
/// read-modify-write cycles, but `save` does not enforce it.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the state atomically, stamping `last_updated`.
    async fn save(&self, state: &PortfolioState) -> Result<()>;

    /// Read and structurally validate the state.
    async fn load(&self) -> Result<PortfolioState>;

    async fn exists(&self) -> bool;

    /// Single lock attempt; fails `PortfolioLocked` if a live holder exists.
    async fn lock(&self) -> Result<LockHandle>;

    async fn unlock(&self, handle: LockHandle) -> Result<()>;

    /// Snapshot the current state, returning the backup location.
    async fn backup_state(&self) -> Result<PathBuf>;

    /// Replace the current state with a backup, backing up the current state first.
    async fn restore_from_backup(&self, backup: &Path) -> Result<()>;

    async fn list_backups(&self) -> Result<Vec<PathBuf>>;

    /// Lock attempt bounded by `timeout`.
    async fn lock_with_timeout(&self, timeout: Duration) -> Result<LockHandle> {
        match tokio::time::timeout(timeout, self.lock()).await {
            Ok(result) => result,
            Err(_) => Err(PortfolioError::LockTimeout { waited: timeout }),
        }
    }
}
