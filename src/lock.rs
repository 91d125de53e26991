//! Single-instance enforcement via a PID-checked lock document.
//!
//! At most one live runtime process owns the engine's mutation path. The
//! lock is advisory: a document whose PID no longer maps to a live process
//! is stale and may be reclaimed.

use crate::error::{LockError, Result};
use crate::room::RoomStore;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// The persisted `_runtime_lock.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDoc {
    pub pid: u32,
    /// Digest of the bot credential, so two different credentials never
    /// collide on the same lock incorrectly.
    #[serde(default)]
    pub token_fingerprint: String,
    pub started_at: String,
    pub heartbeat_at: String,
}

/// Runtime lock manager over the shared store.
#[derive(Debug, Clone)]
pub struct RuntimeLock {
    store: RoomStore,
}

impl RuntimeLock {
    pub fn new(store: RoomStore) -> Self {
        Self { store }
    }

    /// Take the lock for `pid`. Fails when a live process already holds it;
    /// a stale holder (dead PID) is silently overwritten.
    pub fn acquire(&self, token_fingerprint: &str, pid: u32) -> Result<()> {
        if let Some(existing) = self.store.load_lock()
            && pid_alive(existing.pid)
        {
            if !existing.token_fingerprint.is_empty()
                && existing.token_fingerprint == token_fingerprint
            {
                return Err(LockError::DuplicateToken { pid: existing.pid }.into());
            }
            return Err(LockError::DuplicateRuntime { pid: existing.pid }.into());
        }

        let now = crate::now_iso();
        self.store.save_lock(&LockDoc {
            pid,
            token_fingerprint: token_fingerprint.to_string(),
            started_at: now.clone(),
            heartbeat_at: now,
        })?;
        Ok(())
    }

    /// Refresh the heartbeat. No-op unless `pid` is the current owner.
    pub fn touch(&self, pid: u32) -> Result<()> {
        let Some(mut lock) = self.store.load_lock() else {
            return Ok(());
        };
        if lock.pid != pid {
            return Ok(());
        }
        lock.heartbeat_at = crate::now_iso();
        self.store.save_lock(&lock)
    }

    /// Delete the lock document. No-op unless `pid` is the current owner.
    pub fn release(&self, pid: u32) -> Result<()> {
        let Some(lock) = self.store.load_lock() else {
            return Ok(());
        };
        if lock.pid != pid {
            return Ok(());
        }
        self.store.remove_lock()
    }

    /// Whether the persisted lock (if any) belongs to a live process.
    /// `None` when no lock document exists.
    pub fn holder_alive(&self) -> Option<bool> {
        self.store.load_lock().map(|lock| pid_alive(lock.pid))
    }
}

/// Check process liveness with `kill(pid, 0)`. `EPERM` means the process
/// exists but is owned by another user, which still counts as alive;
/// `ESRCH` means dead.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Hex digest of the bot credential for the lock document.
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
