//! Durable, lockable persistence of the shared portfolio document.
//!
//! The file backend writes via temp-file-then-rename and guards
//! read-modify-write cycles with a sentinel marker file. Stale markers
//! (older than five minutes) are presumed abandoned and removed. This is
//! cooperative mutual exclusion, not consensus: a crashed holder blocks
//! other writers until its marker ages out.

mod file;
mod lock;
mod store;

pub use file::{FileStateStore, DEFAULT_STALE_LOCK_MINUTES};
pub use lock::{local_hostname, LockHandle, LockMarker};
pub use store::{StateStore, DEFAULT_LOCK_TIMEOUT};
