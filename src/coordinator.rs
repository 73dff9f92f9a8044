//! Wiring root: one store, one lock service, one permission resolver and one
//! configuration, shared by every entity type registered at startup.
//!
//! Nothing here is process-global; two coordinators in one process are fully
//! independent.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::CoordinatorConfig;
use crate::entity::{EntityKey, FieldSelector};
use crate::error::{MergeError, TransitionError};
use crate::lock::{LockBackend, LockService, MemoryLockBackend};
use crate::merge::{AtomicMerger, MergeOutcome};
use crate::permission::{AllowAll, PermissionResolver};
use crate::state_machine::{TransitionContext, TransitionEngine, TransitionResult, TransitionTable, WorkflowState};
use crate::store::{EntityStore, MemoryStore};

pub struct Coordinator<S> {
    store: Arc<S>,
    locks: LockService,
    permissions: Arc<dyn PermissionResolver>,
    config: CoordinatorConfig,
    merger: AtomicMerger<S>,
    // entity type -> TransitionEngine<W, S>, keyed by W::ENTITY_TYPE
    engines: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl Coordinator<MemoryStore> {
    /// Single-process coordinator over in-memory backends, granting every
    /// permission.
    pub fn in_memory(config: CoordinatorConfig) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLockBackend::new()),
            Arc::new(AllowAll),
            config,
        )
    }
}

impl<S: EntityStore> Coordinator<S> {
    pub fn new(
        store: Arc<S>,
        lock_backend: Arc<dyn LockBackend>,
        permissions: Arc<dyn PermissionResolver>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            locks: LockService::new(lock_backend, config.lock_retry()),
            merger: AtomicMerger::new(Arc::clone(&store), config.merge_retry()),
            store,
            permissions,
            config,
            engines: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn merger(&self) -> &AtomicMerger<S> {
        &self.merger
    }

    /// Register the table for `W::ENTITY_TYPE` and return its engine.
    /// Registering the same entity type again replaces the table.
    pub fn register<W: WorkflowState>(&mut self, table: TransitionTable<W>) -> TransitionEngine<W, S> {
        let engine = TransitionEngine::new(
            Arc::new(table),
            Arc::clone(&self.store),
            self.locks.clone(),
            Arc::clone(&self.permissions),
            self.config.lock_options(),
        );
        self.engines.insert(W::ENTITY_TYPE, Arc::new(engine.clone()));
        engine
    }

    /// Engine for a registered entity type.
    pub fn engine<W: WorkflowState>(&self) -> Option<TransitionEngine<W, S>> {
        self.engines
            .get(W::ENTITY_TYPE)
            .and_then(|engine| engine.downcast_ref::<TransitionEngine<W, S>>())
            .cloned()
    }

    /// Serialized, validated, audited transition of `{W::ENTITY_TYPE}:{id}`.
    pub async fn transition<W: WorkflowState>(
        &self,
        id: &str,
        target: W,
        ctx: &TransitionContext,
    ) -> Result<TransitionResult<W>, TransitionError<W>> {
        let engine = self.engine::<W>().ok_or_else(|| TransitionError::Unregistered {
            entity_type: W::ENTITY_TYPE.to_string(),
        })?;
        engine.transition(id, target, ctx).await
    }

    /// Lock-free merge of one attribute field.
    pub async fn atomic_merge<F>(
        &self,
        entity_type: &str,
        id: &str,
        field: &FieldSelector,
        merge: F,
    ) -> Result<MergeOutcome, MergeError>
    where
        F: FnMut(&Value) -> Value + Send,
    {
        let key = EntityKey::new(entity_type, id);
        self.merger.merge(&key, field, merge).await
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use serde_json::json;

    use super::*;
    use crate::entity::Attributes;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Closed,
        Open,
        Removed,
    }

    impl fmt::Display for Door {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Door::Closed => write!(f, "CLOSED"),
                Door::Open => write!(f, "OPEN"),
                Door::Removed => write!(f, "REMOVED"),
            }
        }
    }

    impl WorkflowState for Door {
        const ENTITY_TYPE: &'static str = "door";

        fn all() -> &'static [Self] {
            &[Door::Closed, Door::Open, Door::Removed]
        }
    }

    fn doors() -> TransitionTable<Door> {
        TransitionTable::builder()
            .initial(Door::Closed)
            .allow(Door::Closed, [Door::Open, Door::Removed])
            .allow(Door::Open, [Door::Closed])
            .terminal(Door::Removed)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn transition_through_registered_engine() {
        let mut coordinator = Coordinator::in_memory(CoordinatorConfig::default());
        let engine = coordinator.register(doors());
        let ctx = TransitionContext::new("keeper");
        engine.create("front", Door::Closed, Attributes::new(), &ctx).unwrap();

        let result = coordinator.transition("front", Door::Open, &ctx).await.unwrap();
        assert_eq!(result.version, 2);
        assert_eq!(engine.snapshot("front").unwrap().state, Door::Open);
        assert_eq!(engine.options(), coordinator.config().lock_options());
    }

    #[tokio::test]
    async fn unregistered_entity_type_is_rejected() {
        let coordinator = Coordinator::in_memory(CoordinatorConfig::default());
        assert!(coordinator.engine::<Door>().is_none());
        let err = coordinator
            .transition("front", Door::Open, &TransitionContext::new("keeper"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::Unregistered { .. }));
    }

    #[tokio::test]
    async fn atomic_merge_shares_the_store() {
        let mut coordinator = Coordinator::in_memory(CoordinatorConfig::default());
        let engine = coordinator.register(doors());
        let ctx = TransitionContext::new("keeper");
        engine.create("front", Door::Closed, Attributes::new(), &ctx).unwrap();

        let field = FieldSelector::new("log");
        let outcome = coordinator
            .atomic_merge("door", "front", &field, crate::merge::append(json!("painted")))
            .await
            .unwrap();
        assert_eq!(outcome.version, 2);

        // The merge bumped the version; the engine re-reads it under the lock.
        let result = coordinator.transition("front", Door::Open, &ctx).await.unwrap();
        assert_eq!(result.version, 3);
    }

    #[tokio::test]
    async fn merge_on_missing_entity_is_not_found() {
        let coordinator = Coordinator::in_memory(CoordinatorConfig::default());
        let err = coordinator
            .atomic_merge("door", "ghost", &FieldSelector::new("log"), crate::merge::increment(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Store(crate::error::StoreError::NotFound(_))));
    }
}
