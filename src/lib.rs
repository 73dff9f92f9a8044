//! Concurrency-control core for workflow entities.
//!
//! Two operation families share one store:
//!
//! - [`TransitionEngine::transition`] moves an entity between lifecycle states
//!   under a per-entity distributed lock, validating against a typed
//!   [`TransitionTable`] and recording an [`AuditRecord`] in the same row
//!   transaction as the state change.
//! - [`AtomicMerger::update`] applies a pure merge function to one attribute
//!   field without a lock, retrying on version conflicts so that concurrent
//!   updates are never lost.
//!
//! [`Coordinator`] wires both to a store, a lock backend and a permission
//! resolver.

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod demo;
pub mod entity;
pub mod error;
pub mod lock;
pub mod merge;
pub mod permission;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod version;

/// Tracing target for lock and backend events that never reach the audit trail.
pub const INFRA_TARGET: &str = "turnstile::infra";

pub use audit::{AuditOutcome, AuditRecord, RejectionKind};
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use entity::{Attributes, Entity, EntityKey, FieldSelector};
pub use error::{
    BackendError, ConfigError, ErrorCategory, LockError, MergeError, SelectorError, StoreError, TableError,
    TransitionError, VersionError,
};
pub use lock::{LockBackend, LockGuard, LockHandle, LockService, MemoryLockBackend};
pub use merge::{AtomicMerger, MergeOutcome};
pub use permission::{AllowAll, PermissionRequest, PermissionResolver, StaticGrants};
pub use retry::RetryConfig;
pub use state_machine::{
    GuardInput, StateSnapshot, TableBuilder, TransitionContext, TransitionEngine, TransitionOptions,
    TransitionResult, TransitionTable, WorkflowState,
};
pub use store::{EntityStore, MemoryStore, RowTxn, TxnError};
pub use version::{Swap, VersionGuard};
