use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entity::EntityKey;

/// Caller-supplied facts about one transition request. Folded into the audit
/// record; never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionContext {
    pub actor: String,
    pub reason: Option<String>,
    pub comment: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Trusted system callers bypass the permission resolver. Guards still run.
    #[serde(default)]
    pub skip_permissions: bool,
}

impl TransitionContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..Default::default()
        }
    }

    /// Context for a trusted internal caller such as a scheduler.
    pub fn system(actor: impl Into<String>) -> Self {
        Self {
            skip_permissions: true,
            ..Self::new(actor)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Per-call tuning of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOptions {
    /// Lock lifetime; must cover the critical section plus scheduling jitter.
    pub lock_ttl: Duration,
    /// How long to wait for the entity lock before giving up.
    pub lock_timeout: Duration,
    /// Re-reads allowed inside the lock when a writer that bypassed the lock
    /// changed the version under us.
    pub max_retries: u32,
}

impl Default for TransitionOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(2),
            max_retries: 3,
        }
    }
}

impl TransitionOptions {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Successful transition, including idempotent no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult<W> {
    pub key: EntityKey,
    pub from: W,
    pub to: W,
    /// Version after the call; unchanged for a no-op.
    pub version: u64,
    /// False when the entity was already in the target state.
    pub applied: bool,
    pub audit_id: Uuid,
}

/// Typed view of an entity's current position in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot<W> {
    pub key: EntityKey,
    pub state: W,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_context_skips_permissions() {
        let ctx = TransitionContext::system("scheduler");
        assert!(ctx.skip_permissions);
        assert_eq!(ctx.actor, "scheduler");
        assert!(!TransitionContext::new("alice").skip_permissions);
    }

    #[test]
    fn context_deserializes_with_defaults() {
        let ctx: TransitionContext =
            serde_json::from_value(json!({"actor": "bob", "reason": null, "comment": "hi"})).unwrap();
        assert_eq!(ctx.actor, "bob");
        assert_eq!(ctx.comment.as_deref(), Some("hi"));
        assert!(ctx.metadata.is_empty());
        assert!(!ctx.skip_permissions);
    }

    #[test]
    fn options_builders() {
        let options = TransitionOptions::default()
            .with_lock_timeout(Duration::from_millis(10))
            .with_lock_ttl(Duration::from_secs(1))
            .with_max_retries(0);
        assert_eq!(options.lock_timeout, Duration::from_millis(10));
        assert_eq!(options.lock_ttl, Duration::from_secs(1));
        assert_eq!(options.max_retries, 0);
    }
}
