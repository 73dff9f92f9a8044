//! Storage boundary.
//!
//! The coordination core never owns persistence. It needs three things from a
//! backend: point reads, a row-level read-modify-write transaction that also
//! carries audit appends, and a durable standalone audit append.

mod memory;

pub use memory::MemoryStore;

use crate::audit::AuditRecord;
use crate::entity::{Entity, EntityKey};
use crate::error::StoreError;

/// Failure of a row transaction: either the closure aborted it, or the store
/// could not commit.
#[derive(Debug)]
pub enum TxnError<E> {
    Aborted(E),
    Store(StoreError),
}

/// Staged copy of one entity row plus audit records to append with it.
///
/// Nothing staged here is visible to other readers until the transaction
/// closure returns `Ok` and the store commits.
#[derive(Debug)]
pub struct RowTxn {
    original_version: u64,
    entity: Entity,
    audit: Vec<AuditRecord>,
}

impl RowTxn {
    pub fn new(entity: Entity) -> Self {
        Self {
            original_version: entity.version,
            entity,
            audit: Vec::new(),
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut Entity {
        &mut self.entity
    }

    /// Version of the row when the transaction started.
    pub fn original_version(&self) -> u64 {
        self.original_version
    }

    pub fn stage_audit(&mut self, record: AuditRecord) {
        self.audit.push(record);
    }

    pub fn staged_audit(&self) -> &[AuditRecord] {
        &self.audit
    }

    pub fn into_parts(self) -> (Entity, Vec<AuditRecord>) {
        (self.entity, self.audit)
    }
}

/// Relational-style storage for entities and their audit trail.
///
/// Implementations must make [`transact`](EntityStore::transact) atomic per
/// row: the row write and every staged audit record land together or not at
/// all, and concurrent transactions on the same row are serialized.
pub trait EntityStore: Send + Sync + 'static {
    /// Insert a new entity together with its creation audit record.
    fn insert(&self, entity: Entity, audit: AuditRecord) -> Result<(), StoreError>;

    /// Read the committed row.
    fn load(&self, key: &EntityKey) -> Result<Entity, StoreError>;

    /// Run `f` against a staged copy of the row under the row lock.
    ///
    /// A staged row whose content changed must carry `version + 1`; an
    /// unchanged row must keep its version. Anything else is refused with
    /// [`StoreError::VersionInvariant`].
    fn transact<T, E, F>(&self, key: &EntityKey, f: F) -> Result<T, TxnError<E>>
    where
        F: FnOnce(&mut RowTxn) -> Result<T, E>;

    /// Durably append a standalone audit record.
    fn append_audit(&self, record: AuditRecord) -> Result<(), StoreError>;

    /// Audit records for one entity, in append order.
    fn audit_trail(&self, key: &EntityKey) -> Result<Vec<AuditRecord>, StoreError>;
}

/// Check the version rule a store enforces on commit.
pub(crate) fn check_version_step(
    original: &Entity,
    staged: &Entity,
    original_version: u64,
) -> Result<(), StoreError> {
    let changed = !original.same_content(staged);
    let expected = if changed {
        original_version + 1
    } else {
        original_version
    };
    if staged.version != expected {
        return Err(StoreError::VersionInvariant {
            key: original.key.clone(),
            current: original_version,
            expected,
            staged: staged.version,
        });
    }
    Ok(())
}
