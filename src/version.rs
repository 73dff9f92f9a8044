//! Optimistic version guard.
//!
//! Compare-and-swap on the entity version: the mutation is applied, and the
//! version bumped, only if the persisted version still equals the one the
//! caller read. Compare and increment run inside a single row transaction.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::entity::{Entity, EntityKey};
use crate::error::VersionError;
use crate::store::{EntityStore, RowTxn, TxnError};

/// Result of a successful [`VersionGuard::check_and_swap`].
#[derive(Debug, Clone, PartialEq)]
pub struct Swap<T> {
    pub new_version: u64,
    /// False when the mutation left state and attributes unchanged; the
    /// version is not bumped in that case.
    pub applied: bool,
    pub entity: Entity,
    pub output: T,
}

pub struct VersionGuard<S> {
    store: Arc<S>,
}

impl<S> Clone for VersionGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: EntityStore> VersionGuard<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Current committed row.
    pub fn read(&self, key: &EntityKey) -> Result<Entity, VersionError> {
        Ok(self.store.load(key)?)
    }

    /// Apply `mutate` if the row is still at `expected_version`.
    ///
    /// `mutate` edits the staged row (and may stage audit records). Any
    /// version or timestamp it writes is overwritten: the guard alone decides
    /// the new version.
    pub fn check_and_swap<T, F>(
        &self,
        key: &EntityKey,
        expected_version: u64,
        mutate: F,
    ) -> Result<Swap<T>, VersionError>
    where
        F: FnOnce(&mut RowTxn) -> T,
    {
        let result = self.store.transact(key, |txn| {
            let actual = txn.entity().version;
            if actual != expected_version {
                return Err(actual);
            }
            let before = txn.entity().clone();
            let output = mutate(txn);

            let applied = !before.same_content(txn.entity());
            let entity = txn.entity_mut();
            if applied {
                entity.version = before.version + 1;
                entity.updated_at = Utc::now();
            } else {
                entity.version = before.version;
                entity.updated_at = before.updated_at;
            }
            Ok((applied, entity.clone(), output))
        });

        match result {
            Ok((applied, entity, output)) => {
                debug!(%key, version = entity.version, applied, "version guard swap");
                Ok(Swap {
                    new_version: entity.version,
                    applied,
                    entity,
                    output,
                })
            }
            Err(TxnError::Aborted(actual)) => {
                debug!(%key, expected_version, actual, "version guard conflict");
                Err(VersionError::ConcurrentModification {
                    key: key.clone(),
                    expected: expected_version,
                    actual,
                })
            }
            Err(TxnError::Store(err)) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRecord;
    use crate::entity::Attributes;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn guard() -> (VersionGuard<MemoryStore>, EntityKey) {
        let store = Arc::new(MemoryStore::new());
        let key = EntityKey::new("task", "1");
        let entity = Entity::new(key.clone(), "OPEN", Attributes::new());
        let record = AuditRecord::created(&entity, "system");
        store.insert(entity, record).unwrap();
        (VersionGuard::new(store), key)
    }

    #[test]
    fn matching_version_applies_and_bumps() {
        let (guard, key) = guard();
        let swap = guard
            .check_and_swap(&key, 1, |txn| {
                txn.entity_mut().state = "DONE".into();
                "ok"
            })
            .unwrap();
        assert!(swap.applied);
        assert_eq!(swap.new_version, 2);
        assert_eq!(swap.output, "ok");
        assert_eq!(guard.read(&key).unwrap().state, "DONE");
    }

    #[test]
    fn stale_version_is_rejected_without_applying() {
        let (guard, key) = guard();
        guard
            .check_and_swap(&key, 1, |txn| {
                txn.entity_mut().attributes.insert("n".into(), json!(1));
            })
            .unwrap();

        let mut called = false;
        let err = guard
            .check_and_swap(&key, 1, |txn| {
                called = true;
                txn.entity_mut().attributes.insert("n".into(), json!(99));
            })
            .unwrap_err();
        assert!(!called);
        assert_eq!(
            err,
            VersionError::ConcurrentModification {
                key: key.clone(),
                expected: 1,
                actual: 2,
            }
        );
        assert_eq!(guard.read(&key).unwrap().attributes["n"], json!(1));
    }

    #[test]
    fn unchanged_row_keeps_version() {
        let (guard, key) = guard();
        let swap = guard.check_and_swap(&key, 1, |_| ()).unwrap();
        assert!(!swap.applied);
        assert_eq!(swap.new_version, 1);
        assert_eq!(guard.read(&key).unwrap().version, 1);
    }

    #[test]
    fn mutation_cannot_forge_version() {
        let (guard, key) = guard();
        let swap = guard
            .check_and_swap(&key, 1, |txn| {
                let entity = txn.entity_mut();
                entity.state = "DONE".into();
                entity.version = 42;
            })
            .unwrap();
        assert_eq!(swap.new_version, 2);
    }

    #[test]
    fn store_failure_propagates() {
        let (guard, key) = guard();
        guard.store().fail_next_commits(1);
        let err = guard
            .check_and_swap(&key, 1, |txn| txn.entity_mut().state = "DONE".into())
            .unwrap_err();
        assert!(matches!(
            err,
            VersionError::Store(StoreError::CommitFailed { .. })
        ));
        assert_eq!(guard.read(&key).unwrap().version, 1);
    }

    #[test]
    fn missing_entity_is_not_found() {
        let (guard, _) = guard();
        let key = EntityKey::new("task", "nope");
        let err = guard.check_and_swap(&key, 1, |_| ()).unwrap_err();
        assert_eq!(err, VersionError::Store(StoreError::NotFound(key)));
    }
}
