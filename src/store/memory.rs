use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::{EntityStore, RowTxn, TxnError, check_version_step};
use crate::audit::AuditRecord;
use crate::entity::{Entity, EntityKey};
use crate::error::StoreError;

/// In-process [`EntityStore`] with per-row locks.
///
/// Intended for tests and single-node deployments. Supports fault injection
/// so rollback and fail-closed paths can be exercised.
pub struct MemoryStore {
    rows: RwLock<HashMap<EntityKey, Arc<Mutex<Entity>>>>,
    audit: Mutex<HashMap<EntityKey, Vec<AuditRecord>>>,
    available: AtomicBool,
    failing_commits: AtomicU32,
    commits: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            audit: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing_commits: AtomicU32::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// The next `n` row transactions fail at commit time and roll back.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of row transactions that wrote a change.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".into()))
        }
    }

    fn row(&self, key: &EntityKey) -> Result<Arc<Mutex<Entity>>, StoreError> {
        self.rows
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EntityStore for MemoryStore {
    fn insert(&self, entity: Entity, audit: AuditRecord) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut rows = self.rows.write();
        if rows.contains_key(&entity.key) {
            return Err(StoreError::AlreadyExists(entity.key));
        }
        let key = entity.key.clone();
        rows.insert(key.clone(), Arc::new(Mutex::new(entity)));
        self.audit.lock().entry(key).or_default().push(audit);
        Ok(())
    }

    fn load(&self, key: &EntityKey) -> Result<Entity, StoreError> {
        self.ensure_available()?;
        let row = self.row(key)?;
        let entity = row.lock().clone();
        Ok(entity)
    }

    fn transact<T, E, F>(&self, key: &EntityKey, f: F) -> Result<T, TxnError<E>>
    where
        F: FnOnce(&mut RowTxn) -> Result<T, E>,
    {
        self.ensure_available().map_err(TxnError::Store)?;
        let row = self.row(key).map_err(TxnError::Store)?;
        let mut committed = row.lock();

        let mut txn = RowTxn::new(committed.clone());
        let output = f(&mut txn).map_err(TxnError::Aborted)?;
        let original_version = txn.original_version();
        let (staged, audit) = txn.into_parts();

        if staged.key != committed.key {
            return Err(TxnError::Store(StoreError::CommitFailed {
                key: key.clone(),
                message: format!("row key cannot change to {}", staged.key),
            }));
        }
        check_version_step(&committed, &staged, original_version).map_err(TxnError::Store)?;

        if self.take_injected_failure() {
            tracing::debug!(%key, "injected commit failure, rolling back");
            return Err(TxnError::Store(StoreError::CommitFailed {
                key: key.clone(),
                message: "injected failure".into(),
            }));
        }

        if !audit.is_empty() {
            self.audit
                .lock()
                .entry(key.clone())
                .or_default()
                .extend(audit);
        }
        if staged.version != committed.version {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        *committed = staged;
        Ok(output)
    }

    fn append_audit(&self, record: AuditRecord) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.audit
            .lock()
            .entry(record.entity.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn audit_trail(&self, key: &EntityKey) -> Result<Vec<AuditRecord>, StoreError> {
        self.ensure_available()?;
        Ok(self.audit.lock().get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditOutcome, AuditRecord};
    use crate::entity::Attributes;
    use serde_json::json;

    fn seeded() -> (MemoryStore, EntityKey) {
        let store = MemoryStore::new();
        let key = EntityKey::new("task", "1");
        let entity = Entity::new(key.clone(), "OPEN", Attributes::new());
        let record = AuditRecord::created(&entity, "system");
        store.insert(entity, record).unwrap();
        (store, key)
    }

    fn bump(txn: &mut RowTxn, state: &str) {
        let entity = txn.entity_mut();
        entity.state = state.into();
        entity.version += 1;
    }

    #[test]
    fn insert_then_load() {
        let (store, key) = seeded();
        let entity = store.load(&key).unwrap();
        assert_eq!(entity.state, "OPEN");
        assert_eq!(store.audit_trail(&key).unwrap().len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let (store, key) = seeded();
        let entity = Entity::new(key.clone(), "OPEN", Attributes::new());
        let record = AuditRecord::created(&entity, "system");
        assert_eq!(
            store.insert(entity, record),
            Err(StoreError::AlreadyExists(key))
        );
    }

    #[test]
    fn committed_transaction_writes_row_and_audit() {
        let (store, key) = seeded();
        store
            .transact(&key, |txn| {
                let before = txn.entity().clone();
                bump(txn, "DONE");
                let after = txn.entity().clone();
                txn.stage_audit(AuditRecord::for_change(
                    &before,
                    &after,
                    "alice",
                    AuditOutcome::Applied,
                ));
                Ok::<_, ()>(())
            })
            .unwrap();
        let entity = store.load(&key).unwrap();
        assert_eq!(entity.state, "DONE");
        assert_eq!(entity.version, 2);
        assert_eq!(store.audit_trail(&key).unwrap().len(), 2);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn aborted_transaction_writes_nothing() {
        let (store, key) = seeded();
        let result = store.transact(&key, |txn| {
            bump(txn, "DONE");
            Err::<(), _>("nope")
        });
        assert!(matches!(result, Err(TxnError::Aborted("nope"))));
        assert_eq!(store.load(&key).unwrap().version, 1);
    }

    #[test]
    fn change_without_version_bump_is_refused() {
        let (store, key) = seeded();
        let result = store.transact(&key, |txn| {
            txn.entity_mut().attributes.insert("x".into(), json!(1));
            Ok::<_, ()>(())
        });
        assert!(matches!(
            result,
            Err(TxnError::Store(StoreError::VersionInvariant {
                current: 1,
                expected: 2,
                staged: 1,
                ..
            }))
        ));
        assert!(store.load(&key).unwrap().attributes.is_empty());
    }

    #[test]
    fn injected_failure_rolls_back_row_and_audit() {
        let (store, key) = seeded();
        store.fail_next_commits(1);
        let result = store.transact(&key, |txn| {
            let before = txn.entity().clone();
            bump(txn, "DONE");
            let after = txn.entity().clone();
            txn.stage_audit(AuditRecord::for_change(
                &before,
                &after,
                "alice",
                AuditOutcome::Applied,
            ));
            Ok::<_, ()>(())
        });
        assert!(matches!(
            result,
            Err(TxnError::Store(StoreError::CommitFailed { .. }))
        ));
        assert_eq!(store.load(&key).unwrap().state, "OPEN");
        assert_eq!(store.audit_trail(&key).unwrap().len(), 1);

        // Only one failure was injected.
        store
            .transact(&key, |txn| {
                bump(txn, "DONE");
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(store.load(&key).unwrap().version, 2);
    }

    #[test]
    fn unavailable_store_fails_everything() {
        let (store, key) = seeded();
        store.set_available(false);
        assert!(matches!(store.load(&key), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.transact(&key, |_| Ok::<_, ()>(())),
            Err(TxnError::Store(StoreError::Unavailable(_)))
        ));
        store.set_available(true);
        assert!(store.load(&key).is_ok());
    }

    #[test]
    fn missing_row_is_not_found() {
        let store = MemoryStore::new();
        let key = EntityKey::new("task", "missing");
        assert_eq!(store.load(&key), Err(StoreError::NotFound(key.clone())));
        assert!(store.audit_trail(&key).unwrap().is_empty());
    }
}
