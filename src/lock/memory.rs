use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use super::{LockBackend, deadline_after};
use crate::error::BackendError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    token: Uuid,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Single-process lock backend with the same TTL semantics as a shared
/// key-value store (`SET key token NX PX ttl`).
#[derive(Debug)]
pub struct MemoryLockBackend {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl Default for MemoryLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing the connection to the backend.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Token of the live holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<Uuid> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.token)
    }

    /// Stored entries, live or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), BackendError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError("memory lock backend disabled".into()))
        }
    }
}

impl LockBackend for MemoryLockBackend {
    fn set_if_absent(&self, key: &str, token: Uuid, ttl: Duration) -> Result<bool, BackendError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        // Holders that crashed never release; sweep them here.
        entries.retain(|_, entry| entry.is_live(now));
        entries.insert(
            key.to_string(),
            Entry {
                token,
                expires_at: deadline_after(now, ttl),
            },
        );
        Ok(true)
    }

    fn delete_if_owner(&self, key: &str, token: Uuid) -> Result<bool, BackendError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.token == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn extend_if_owner(&self, key: &str, token: Uuid, additional: Duration) -> Result<bool, BackendError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.token == token && entry.is_live(now) => {
                entry.expires_at = deadline_after(entry.expires_at, additional);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
