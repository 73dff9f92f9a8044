use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::entity::EntityKey;

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Business rule rejected the request; never retried automatically.
    Validation,
    /// Another writer got there first; retry with backoff.
    Contention,
    /// Storage or lock backend failed; the calling layer owns the policy.
    Infrastructure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "Validation"),
            ErrorCategory::Contention => write!(f, "Contention"),
            ErrorCategory::Infrastructure => write!(f, "Infrastructure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("field selector must have at least one non-empty segment")]
    Empty,

    #[error("attribute `{path}` is not an object")]
    NotAnObject { path: String },
}

/// Failures reported by an [`EntityStore`](crate::store::EntityStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(EntityKey),

    #[error("entity already exists: {0}")]
    AlreadyExists(EntityKey),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("transaction on {key} failed and was rolled back: {message}")]
    CommitFailed { key: EntityKey, message: String },

    #[error("write to {key} must move version {current} to {expected}, got {staged}")]
    VersionInvariant {
        key: EntityKey,
        current: u64,
        expected: u64,
        staged: u64,
    },
}

/// Raw failure from a lock backend (connection refused, timeout talking to it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lock backend error: {0}")]
pub struct BackendError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock `{key}` ({attempts} attempts)")]
    Timeout {
        key: String,
        waited: Duration,
        attempts: u32,
    },

    /// Fail closed: an unreachable backend never means "proceed unlocked".
    #[error("could not acquire lock `{key}`: {source}")]
    Backend {
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("lock `{key}` expired before the critical section finished")]
    Lost { key: String },
}

impl LockError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LockError::Timeout { .. } => ErrorCategory::Contention,
            LockError::Backend { .. } | LockError::Lost { .. } => ErrorCategory::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Contention
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("concurrent modification of {key}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        key: EntityKey,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("merge into {key} field `{field}` gave up after {attempts} attempts under contention")]
    RetriesExhausted {
        key: EntityKey,
        field: String,
        attempts: u32,
    },

    #[error("merge into {key}: {source}")]
    Selector {
        key: EntityKey,
        #[source]
        source: SelectorError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MergeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MergeError::RetriesExhausted { .. } => ErrorCategory::Contention,
            MergeError::Selector { .. } => ErrorCategory::Validation,
            MergeError::Store(_) => ErrorCategory::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Contention
    }
}

/// Outcome of a rejected or failed transition, reported with the entity's
/// actual current state where one was read.
#[derive(Debug, Error)]
pub enum TransitionError<S> {
    #[error("{key} cannot move from {current} to {target}")]
    InvalidTransition { key: EntityKey, current: S, target: S },

    #[error("{actor} may not move {key} to {target} (currently {current})")]
    PermissionDenied {
        key: EntityKey,
        actor: String,
        current: S,
        target: S,
    },

    #[error("guard on {target} rejected {key} (currently {current}): {reason}")]
    GuardRejected {
        key: EntityKey,
        current: S,
        target: S,
        reason: String,
    },

    #[error("{state} is not an initial state for {entity_type}")]
    NotInitial { entity_type: String, state: S },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{key} kept changing underneath the lock: expected version {expected}, found {actual}")]
    ConcurrentModification {
        key: EntityKey,
        expected: u64,
        actual: u64,
    },

    #[error("entity not found: {0}")]
    NotFound(EntityKey),

    #[error("entity already exists: {0}")]
    AlreadyExists(EntityKey),

    #[error("{key} has unknown persisted state `{value}`")]
    UnknownState { key: EntityKey, value: String },

    #[error("no transition table registered for entity type `{entity_type}`")]
    Unregistered { entity_type: String },

    #[error(transparent)]
    Store(StoreError),
}

impl<S> TransitionError<S> {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransitionError::InvalidTransition { .. }
            | TransitionError::PermissionDenied { .. }
            | TransitionError::GuardRejected { .. }
            | TransitionError::NotInitial { .. }
            | TransitionError::Unregistered { .. }
            | TransitionError::NotFound(_)
            | TransitionError::AlreadyExists(_) => ErrorCategory::Validation,
            TransitionError::Lock(err) => err.category(),
            TransitionError::ConcurrentModification { .. } => ErrorCategory::Contention,
            TransitionError::UnknownState { .. } | TransitionError::Store(_) => {
                ErrorCategory::Infrastructure
            }
        }
    }

    /// Whether the caller may retry the same request after backing off.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Contention
    }
}

impl<S> From<StoreError> for TransitionError<S> {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => TransitionError::NotFound(key),
            StoreError::AlreadyExists(key) => TransitionError::AlreadyExists(key),
            other => TransitionError::Store(other),
        }
    }
}

impl<S> From<VersionError> for TransitionError<S> {
    fn from(err: VersionError) -> Self {
        match err {
            VersionError::ConcurrentModification {
                key,
                expected,
                actual,
            } => TransitionError::ConcurrentModification {
                key,
                expected,
                actual,
            },
            VersionError::Store(store) => store.into(),
        }
    }
}

/// Problems building a transition table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("{entity_type}: no initial state declared")]
    NoInitialState { entity_type: String },

    #[error("{entity_type}: no terminal state (every state has outgoing transitions)")]
    NoTerminalState { entity_type: String },

    #[error("{entity_type}: state {state} is declared terminal but has outgoing transitions")]
    TerminalWithTargets { entity_type: String, state: String },

    #[error("{entity_type}: more than one state displays as `{code}`")]
    DuplicateCode { entity_type: String, code: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_display() {
        let err = LockError::Timeout {
            key: "ticket:1".into(),
            waited: Duration::from_millis(150),
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "timed out after 150ms waiting for lock `ticket:1` (4 attempts)"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn backend_failure_is_not_retryable() {
        let err = LockError::Backend {
            key: "ticket:1".into(),
            source: BackendError("connection refused".into()),
        };
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
        assert!(!err.is_retryable());
    }

    #[test]
    fn store_not_found_maps_to_transition_not_found() {
        let key = EntityKey::new("task", "7");
        let err: TransitionError<&str> = StoreError::NotFound(key.clone()).into();
        assert!(matches!(err, TransitionError::NotFound(k) if k == key));
    }

    #[test]
    fn version_conflict_maps_to_contention() {
        let err: TransitionError<&str> = VersionError::ConcurrentModification {
            key: EntityKey::new("task", "7"),
            expected: 3,
            actual: 4,
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_transition_reports_current_state() {
        let err = TransitionError::InvalidTransition {
            key: EntityKey::new("ticket", "9"),
            current: "CLOSED",
            target: "OPEN",
        };
        assert_eq!(err.to_string(), "ticket:9 cannot move from CLOSED to OPEN");
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransitionError<&'static str>>();
        assert_send_sync::<MergeError>();
        assert_send_sync::<LockError>();
    }
}
