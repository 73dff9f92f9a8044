//! Named, TTL-bounded mutual exclusion per entity.
//!
//! [`LockService`] wraps a [`LockBackend`] (a shared key-value store in
//! production, [`MemoryLockBackend`] in tests) and adds bounded, jittered
//! waiting. Acquisition yields a [`LockGuard`] that releases on drop.
//!
//! Every handle carries a token unique to its acquisition. Release and
//! extension are compare-on-token, so a holder whose TTL lapsed can never
//! release or extend a lock that has since been handed to someone else.

mod memory;

pub use memory::MemoryLockBackend;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::INFRA_TARGET;
use crate::error::{BackendError, LockError};
use crate::retry::RetryConfig;

/// Storage primitive behind the lock service.
///
/// Each method must be atomic at the backend: no two concurrent
/// `set_if_absent` calls on the same live key may both return `true`.
pub trait LockBackend: Send + Sync {
    /// Store `token` under `key` with `ttl` unless a live entry exists.
    fn set_if_absent(&self, key: &str, token: Uuid, ttl: Duration) -> Result<bool, BackendError>;

    /// Remove `key` only if it still holds `token`.
    fn delete_if_owner(&self, key: &str, token: Uuid) -> Result<bool, BackendError>;

    /// Push the expiry of a live `key` out by `additional` only if it still holds `token`.
    fn extend_if_owner(&self, key: &str, token: Uuid, additional: Duration) -> Result<bool, BackendError>;
}

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource_key: String,
    pub token: Uuid,
    pub acquired_at: Instant,
    /// Local, conservative view of the backend expiry.
    pub expires_at: Instant,
}

impl LockHandle {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Scoped ownership of a [`LockHandle`]; releases on drop.
pub struct LockGuard {
    handle: LockHandle,
    backend: Arc<dyn LockBackend>,
    released: bool,
}

impl LockGuard {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_handle(self.backend.as_ref(), &self.handle);
    }
}

impl Deref for LockGuard {
    type Target = LockHandle;

    fn deref(&self) -> &LockHandle {
        &self.handle
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish()
    }
}

/// `from + duration`, saturating to a far-future instant instead of
/// overflowing. `Duration::MAX` means "no deadline".
pub(crate) fn deadline_after(from: Instant, duration: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
    from.checked_add(duration)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

// Never fails: a backend error here is logged and left to TTL expiry.
fn release_handle(backend: &dyn LockBackend, handle: &LockHandle) {
    match backend.delete_if_owner(&handle.resource_key, handle.token) {
        Ok(true) => debug!(key = %handle.resource_key, "lock released"),
        Ok(false) => warn!(
            target: INFRA_TARGET,
            key = %handle.resource_key,
            "lock was no longer held at release (expired or taken over)"
        ),
        Err(err) => warn!(
            target: INFRA_TARGET,
            key = %handle.resource_key,
            error = %err,
            "lock release failed; relying on TTL expiry"
        ),
    }
}

/// Acquires and releases per-resource locks against a shared backend.
#[derive(Clone)]
pub struct LockService {
    backend: Arc<dyn LockBackend>,
    retry: RetryConfig,
}

impl fmt::Debug for LockService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockService")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl LockService {
    /// `retry` shapes the wait between attempts; its `max_retries` is unused
    /// because waiting is bounded by the caller's timeout instead.
    pub fn new(backend: Arc<dyn LockBackend>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    /// In-process service over a fresh [`MemoryLockBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLockBackend::new()), RetryConfig::default())
    }

    /// Acquire `key`, waiting up to `blocking_timeout`.
    ///
    /// A zero timeout makes a single attempt. Backend failures fail closed
    /// immediately with [`LockError::Backend`]. Dropping the returned future
    /// abandons the wait without holding anything.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        blocking_timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let deadline = deadline_after(started, blocking_timeout);
        let token = Uuid::new_v4();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if let Some(guard) = self.attempt(key, token, ttl)? {
                debug!(key, attempts, waited = ?started.elapsed(), "lock acquired");
                return Ok(guard);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                warn!(target: INFRA_TARGET, key, attempts, ?waited, "lock acquisition timed out");
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited,
                    attempts,
                });
            }
            let remaining = deadline - now;
            let delay = self
                .retry
                .jittered_delay(attempts)
                .max(Duration::from_millis(1))
                .min(remaining);
            tokio::time::sleep(delay).await;
        }
    }

    /// One non-blocking attempt; `Ok(None)` when someone else holds `key`.
    pub fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        self.attempt(key, Uuid::new_v4(), ttl)
    }

    /// Release a handle. Idempotent, never fails; a guard does this on drop.
    pub fn release(&self, handle: &LockHandle) {
        release_handle(self.backend.as_ref(), handle);
    }

    /// Extend a held lock by `additional`. `false` when the lock was lost or
    /// the backend could not be reached.
    pub fn extend(&self, guard: &mut LockGuard, additional: Duration) -> bool {
        if guard.released {
            return false;
        }
        match self
            .backend
            .extend_if_owner(&guard.handle.resource_key, guard.handle.token, additional)
        {
            Ok(true) => {
                guard.handle.expires_at = deadline_after(guard.handle.expires_at, additional);
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(
                    target: INFRA_TARGET,
                    key = %guard.handle.resource_key,
                    error = %err,
                    "lock extension failed"
                );
                false
            }
        }
    }

    fn attempt(&self, key: &str, token: Uuid, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        // Taken before the backend call so the local expiry is never later than the real one.
        let acquired_at = Instant::now();
        match self.backend.set_if_absent(key, token, ttl) {
            Ok(true) => Ok(Some(LockGuard {
                handle: LockHandle {
                    resource_key: key.to_string(),
                    token,
                    acquired_at,
                    expires_at: deadline_after(acquired_at, ttl),
                },
                backend: Arc::clone(&self.backend),
                released: false,
            })),
            Ok(false) => Ok(None),
            Err(source) => {
                warn!(target: INFRA_TARGET, key, error = %source, "lock backend unavailable");
                Err(LockError::Backend {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }
}
