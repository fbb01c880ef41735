//! File-backed state store with atomic writes and a sentinel lock file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{local_hostname, LockHandle, LockMarker, StateStore};
use crate::error::{PortfolioError, Result};
use crate::models::PortfolioState;

/// Markers older than this are treated as abandoned.
pub const DEFAULT_STALE_LOCK_MINUTES: i64 = 5;

const BACKUP_INFIX: &str = ".backup_";
const MAX_BACKUP_ATTEMPTS: u32 = 1000;

/// Stores `PortfolioState` as a JSON document next to a `.lock` marker.
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    stale_after: Duration,
    hostname: String,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, ".lock");
        Self {
            path,
            lock_path,
            stale_after: Duration::minutes(DEFAULT_STALE_LOCK_MINUTES),
            hostname: local_hostname(),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Current lock marker, if any.
    pub async fn read_marker(&self) -> Result<Option<LockMarker>> {
        read_marker_at(&self.lock_path).await
    }

    async fn create_marker(&self) -> std::io::Result<LockMarker> {
        let marker = LockMarker::acquire(&self.hostname);
        let json = serde_json::to_vec(&marker)?;

        if let Some(parent) = non_empty_parent(&self.lock_path) {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;
        file.write_all(&json).await?;
        file.sync_all().await?;

        Ok(marker)
    }

    fn temp_path(&self) -> PathBuf {
        sibling(&self.path, &format!(".tmp.{}", Uuid::new_v4().simple()))
    }

    fn backup_path(&self, at: DateTime<Utc>, attempt: u32) -> PathBuf {
        let stamp = at.format("%Y%m%d%H%M%S%3f");
        let suffix = if attempt == 0 {
            format!("{}{}", BACKUP_INFIX, stamp)
        } else {
            format!("{}{}_{:03}", BACKUP_INFIX, stamp, attempt)
        };
        sibling(&self.path, &suffix)
    }

    /// Write `bytes` to a backup name nobody else holds.
    async fn write_backup(&self, bytes: &[u8]) -> Result<PathBuf> {
        let at = Utc::now();
        for attempt in 0..MAX_BACKUP_ATTEMPTS {
            let backup_path = self.backup_path(at, attempt);
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&backup_path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            file.write_all(bytes).await?;
            file.sync_all().await?;
            return Ok(backup_path);
        }
        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free backup name for {}", self.path.display()),
        )
        .into())
    }

    /// Move a stale marker out of the way. Returns false when the marker
    /// changed hands after it was inspected; the live marker is put back.
    async fn evict_stale(&self, stale: &LockMarker) -> Result<bool> {
        let evicted_path = sibling(&self.lock_path, &format!(".stale.{}", Uuid::new_v4().simple()));
        match fs::rename(&self.lock_path, &evicted_path).await {
            Ok(()) => {}
            // Someone else already evicted it
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let evicted = read_marker_at(&evicted_path).await?;
        if evicted.as_ref().map_or(true, |m| m == stale) {
            remove_if_present(&evicted_path).await;
            return Ok(true);
        }

        // A fresh marker replaced the stale one before our rename
        let restored = fs::hard_link(&evicted_path, &self.lock_path).await;
        remove_if_present(&evicted_path).await;
        match restored {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// `PortfolioLocked` naming whoever holds the marker now.
    async fn locked_now(&self) -> PortfolioError {
        match self.read_marker().await {
            Ok(Some(marker)) => Self::locked_error(&marker),
            _ => PortfolioError::PortfolioLocked {
                holder: "unknown".to_string(),
                since: Utc::now(),
            },
        }
    }

    async fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = non_empty_parent(&self.path) {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.temp_path();
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp file");
                }
            }
            return Err(e.into());
        }

        Ok(())
    }

    fn locked_error(marker: &LockMarker) -> PortfolioError {
        PortfolioError::PortfolioLocked {
            holder: marker.holder(),
            since: marker.timestamp,
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, state: &PortfolioState) -> Result<()> {
        let mut stamped = state.clone();
        stamped.last_updated = Utc::now();

        let json = serde_json::to_vec_pretty(&stamped)?;
        self.write_atomic(&json).await?;

        debug!(
            path = %self.path.display(),
            version = stamped.version,
            bots = stamped.allocations.len(),
            "Saved portfolio state"
        );
        Ok(())
    }

    async fn load(&self) -> Result<PortfolioState> {
        let raw = fs::read(&self.path).await?;
        let state = parse_state(&raw)?;

        debug!(
            path = %self.path.display(),
            version = state.version,
            bots = state.allocations.len(),
            "Loaded portfolio state"
        );
        Ok(state)
    }

    async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    async fn lock(&self) -> Result<LockHandle> {
        match self.create_marker().await {
            Ok(marker) => {
                debug!(path = %self.lock_path.display(), "Acquired portfolio lock");
                return Ok(LockHandle::from_marker(&marker));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(existing) = self.read_marker().await? {
            if !existing.is_stale(self.stale_after) {
                return Err(Self::locked_error(&existing));
            }

            warn!(
                holder = %existing.holder(),
                age_secs = existing.age().num_seconds(),
                "Removing stale portfolio lock"
            );
            if !self.evict_stale(&existing).await? {
                return Err(self.locked_now().await);
            }
        }

        match self.create_marker().await {
            Ok(marker) => {
                debug!(path = %self.lock_path.display(), "Acquired portfolio lock");
                Ok(LockHandle::from_marker(&marker))
            }
            // Another process won the race after the stale marker was removed
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(self.locked_now().await),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, handle: LockHandle) -> Result<()> {
        match self.read_marker().await? {
            None => {
                warn!(holder = %handle.holder, "Lock marker already gone on unlock");
                Ok(())
            }
            Some(marker) if marker.token != handle.token => {
                warn!(
                    ours = %handle.holder,
                    theirs = %marker.holder(),
                    "Lock taken over by another holder"
                );
                Err(Self::locked_error(&marker))
            }
            Some(_) => {
                match fs::remove_file(&self.lock_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                debug!(
                    held_ms = (Utc::now() - handle.acquired_at).num_milliseconds(),
                    "Released portfolio lock"
                );
                Ok(())
            }
        }
    }

    async fn backup_state(&self) -> Result<PathBuf> {
        let raw = fs::read(&self.path).await?;
        let backup_path = self.write_backup(&raw).await?;

        info!(backup = %backup_path.display(), "Backed up portfolio state");
        Ok(backup_path)
    }

    async fn restore_from_backup(&self, backup: &Path) -> Result<()> {
        let raw = fs::read(backup).await?;
        parse_state(&raw)?;

        if self.exists().await {
            let pre_restore = self.backup_state().await?;
            info!(backup = %pre_restore.display(), "Created pre-restore backup");
        }

        self.write_atomic(&raw).await?;

        info!(backup = %backup.display(), "Restored portfolio state from backup");
        Ok(())
    }

    async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let dir = non_empty_parent(&self.path).unwrap_or_else(|| Path::new("."));
        let prefix = match self.path.file_name() {
            Some(name) => format!("{}{}", name.to_string_lossy(), BACKUP_INFIX),
            None => return Ok(Vec::new()),
        };

        let mut backups = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                backups.push(entry.path());
            }
        }

        // Timestamp suffix sorts chronologically
        backups.sort();
        Ok(backups)
    }
}

async fn read_marker_at(path: &Path) -> Result<Option<LockMarker>> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str::<LockMarker>(&raw) {
        Ok(marker) => Ok(Some(marker)),
        Err(e) => {
            // Half-written or foreign marker: age it by its mtime
            debug!(error = %e, "Unreadable lock marker, falling back to mtime");
            let modified = match fs::metadata(path).await {
                Ok(meta) => meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            Ok(Some(LockMarker {
                timestamp: modified,
                process_id: 0,
                hostname: "unknown".to_string(),
                token: Uuid::nil(),
            }))
        }
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

fn parse_state(raw: &[u8]) -> Result<PortfolioState> {
    let state: PortfolioState = serde_json::from_slice(raw)
        .map_err(|e| PortfolioError::StateCorrupted(format!("unreadable state document: {}", e)))?;
    state.validate_structure()?;
    Ok(state)
}

/// `<path><suffix>` in the same directory.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}
