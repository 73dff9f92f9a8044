//! Serialized, audited state transitions.
//!
//! Every transition of one entity runs under that entity's distributed lock:
//!
//! 1. acquire `{entity_type}:{id}` (bounded by the lock timeout, no retry)
//! 2. re-read state and version from the store
//! 3. same state: succeed as a no-op, audit it, no version bump
//! 4. check the table, the permission resolver and the guards
//! 5. write state, version + 1 and the audit record in one row transaction
//!    through the version guard
//! 6. release the lock on every exit path
//!
//! A version mismatch in step 5 means a writer bypassed the lock; the engine
//! re-reads and re-validates up to `max_retries` times while still holding it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::context::{StateSnapshot, TransitionContext, TransitionOptions, TransitionResult};
use super::state::{GuardInput, TransitionTable, WorkflowState};
use crate::INFRA_TARGET;
use crate::audit::{AuditOutcome, AuditRecord, RejectionKind};
use crate::entity::{Attributes, Entity, EntityKey};
use crate::error::{LockError, TransitionError};
use crate::lock::{LockGuard, LockService};
use crate::permission::{PermissionRequest, PermissionResolver};
use crate::store::EntityStore;
use crate::version::VersionGuard;

type Result<T, W> = std::result::Result<T, TransitionError<W>>;

/// Drives entities of one type through their [`TransitionTable`].
pub struct TransitionEngine<W, S> {
    table: Arc<TransitionTable<W>>,
    store: Arc<S>,
    guard: VersionGuard<S>,
    locks: LockService,
    permissions: Arc<dyn PermissionResolver>,
    options: TransitionOptions,
}

impl<W, S> Clone for TransitionEngine<W, S> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            store: Arc::clone(&self.store),
            guard: self.guard.clone(),
            locks: self.locks.clone(),
            permissions: Arc::clone(&self.permissions),
            options: self.options,
        }
    }
}

impl<W: WorkflowState, S: EntityStore> TransitionEngine<W, S> {
    pub fn new(
        table: Arc<TransitionTable<W>>,
        store: Arc<S>,
        locks: LockService,
        permissions: Arc<dyn PermissionResolver>,
        options: TransitionOptions,
    ) -> Self {
        Self {
            table,
            guard: VersionGuard::new(Arc::clone(&store)),
            store,
            locks,
            permissions,
            options,
        }
    }

    pub fn table(&self) -> &TransitionTable<W> {
        &self.table
    }

    pub fn options(&self) -> TransitionOptions {
        self.options
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    pub fn key(&self, id: &str) -> EntityKey {
        EntityKey::new(W::ENTITY_TYPE, id)
    }

    /// Insert a new entity in one of the table's initial states.
    pub fn create(
        &self,
        id: &str,
        initial: W,
        attributes: Attributes,
        ctx: &TransitionContext,
    ) -> Result<TransitionResult<W>, W> {
        if !self.table.is_initial(initial) {
            return Err(TransitionError::NotInitial {
                entity_type: W::ENTITY_TYPE.to_string(),
                state: initial,
            });
        }
        let entity = Entity::new(self.key(id), initial.to_string(), attributes);
        let record = AuditRecord::created(&entity, &ctx.actor).with_context(ctx);
        let result = TransitionResult {
            key: entity.key.clone(),
            from: initial,
            to: initial,
            version: entity.version,
            applied: true,
            audit_id: record.id,
        };
        self.store.insert(entity, record)?;
        info!(key = %result.key, state = %initial, actor = %ctx.actor, "entity created");
        Ok(result)
    }

    /// Typed current state and version, read straight from the store.
    pub fn snapshot(&self, id: &str) -> Result<StateSnapshot<W>, W> {
        let entity = self.store.load(&self.key(id))?;
        let state = parse_state(&entity)?;
        Ok(StateSnapshot {
            key: entity.key,
            state,
            version: entity.version,
        })
    }

    /// Legal next states from the persisted state.
    pub fn allowed_targets(&self, id: &str) -> Result<Vec<W>, W> {
        let snapshot = self.snapshot(id)?;
        Ok(self.table.allowed(snapshot.state).to_vec())
    }

    /// Audit trail of one entity, oldest first.
    pub fn history(&self, id: &str) -> Result<Vec<AuditRecord>, W> {
        Ok(self.store.audit_trail(&self.key(id))?)
    }

    /// Transition with the engine's default options.
    pub async fn transition(&self, id: &str, target: W, ctx: &TransitionContext) -> Result<TransitionResult<W>, W> {
        self.transition_with(id, target, ctx, self.options).await
    }

    /// Move entity `id` to `target`.
    ///
    /// Lock timeouts are returned immediately; retrying is the caller's call,
    /// since a retry must re-evaluate guards against fresh state anyway.
    pub async fn transition_with(
        &self,
        id: &str,
        target: W,
        ctx: &TransitionContext,
        options: TransitionOptions,
    ) -> Result<TransitionResult<W>, W> {
        let key = self.key(id);
        let lock = match self
            .locks
            .acquire(&key.resource_key(), options.lock_ttl, options.lock_timeout)
            .await
        {
            Ok(lock) => lock,
            Err(err) => {
                warn!(
                    target: INFRA_TARGET,
                    %key,
                    %target,
                    actor = %ctx.actor,
                    error = %err,
                    "transition abandoned before validation"
                );
                return Err(err.into());
            }
        };

        let result = self.transition_locked(&key, target, ctx, &lock, options.max_retries);
        lock.release();
        result
    }

    fn transition_locked(
        &self,
        key: &EntityKey,
        target: W,
        ctx: &TransitionContext,
        lock: &LockGuard,
        max_retries: u32,
    ) -> Result<TransitionResult<W>, W> {
        let mut attempt: u32 = 0;
        loop {
            let entity = self.store.load(key)?;
            match self.apply(&entity, target, ctx, lock) {
                Err(TransitionError::ConcurrentModification {
                    expected, actual, ..
                }) if attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        %key,
                        expected,
                        actual,
                        attempt,
                        "version moved under the entity lock; a writer bypassed it, re-validating"
                    );
                }
                other => return other,
            }
        }
    }

    fn apply(
        &self,
        entity: &Entity,
        target: W,
        ctx: &TransitionContext,
        lock: &LockGuard,
    ) -> Result<TransitionResult<W>, W> {
        let key = &entity.key;
        let current = parse_state(entity)?;

        if current == target {
            let record = AuditRecord::for_change(entity, entity, &ctx.actor, AuditOutcome::NoOp).with_context(ctx);
            let audit_id = record.id;
            self.store.append_audit(record)?;
            debug!(%key, state = %current, "transition is a no-op");
            return Ok(TransitionResult {
                key: key.clone(),
                from: current,
                to: target,
                version: entity.version,
                applied: false,
                audit_id,
            });
        }

        if !self.table.allows(current, target) {
            return Err(self.reject(
                entity,
                target,
                ctx,
                RejectionKind::InvalidTransition,
                TransitionError::InvalidTransition {
                    key: key.clone(),
                    current,
                    target,
                },
            ));
        }

        if !ctx.skip_permissions {
            let target_code = target.to_string();
            let request = PermissionRequest {
                actor: &ctx.actor,
                entity_type: &key.entity_type,
                entity_id: &key.id,
                target_state: &target_code,
                permission: self.table.required_permission(target),
            };
            if !self.permissions.can_transition(&request) {
                return Err(self.reject(
                    entity,
                    target,
                    ctx,
                    RejectionKind::PermissionDenied,
                    TransitionError::PermissionDenied {
                        key: key.clone(),
                        actor: ctx.actor.clone(),
                        current,
                        target,
                    },
                ));
            }
        }

        let input = GuardInput {
            entity,
            current,
            target,
            context: ctx,
        };
        if let Err((guard, reason)) = self.table.check_guards(&input) {
            return Err(self.reject(
                entity,
                target,
                ctx,
                RejectionKind::GuardRejected,
                TransitionError::GuardRejected {
                    key: key.clone(),
                    current,
                    target,
                    reason: format!("{guard}: {reason}"),
                },
            ));
        }

        if lock.is_expired() {
            warn!(target: INFRA_TARGET, %key, "lock expired before commit; refusing to write");
            return Err(LockError::Lost {
                key: lock.resource_key.clone(),
            }
            .into());
        }

        let swap = self.guard.check_and_swap(key, entity.version, |txn| {
            let before = txn.entity().clone();
            txn.entity_mut().state = target.to_string();
            let mut after = txn.entity().clone();
            after.version = before.version + 1;
            let record = AuditRecord::for_change(&before, &after, &ctx.actor, AuditOutcome::Applied).with_context(ctx);
            let audit_id = record.id;
            txn.stage_audit(record);
            audit_id
        })?;

        info!(
            %key,
            from = %current,
            to = %target,
            version = swap.new_version,
            actor = %ctx.actor,
            "transition applied"
        );
        Ok(TransitionResult {
            key: key.clone(),
            from: current,
            to: target,
            version: swap.new_version,
            applied: true,
            audit_id: swap.output,
        })
    }

    /// Audit a validated rejection, then hand back the error. A failed audit
    /// append is logged but never masks the business outcome.
    fn reject(
        &self,
        entity: &Entity,
        target: W,
        ctx: &TransitionContext,
        kind: RejectionKind,
        err: TransitionError<W>,
    ) -> TransitionError<W> {
        let record =
            AuditRecord::rejected(entity, &target.to_string(), &ctx.actor, kind, err.to_string()).with_context(ctx);
        if let Err(store_err) = self.store.append_audit(record) {
            error!(key = %entity.key, error = %store_err, "failed to audit rejected transition");
        }
        debug!(key = %entity.key, %target, ?kind, "transition rejected");
        err
    }
}

fn parse_state<W: WorkflowState>(entity: &Entity) -> Result<W, W> {
    W::from_code(&entity.state).ok_or_else(|| TransitionError::UnknownState {
        key: entity.key.clone(),
        value: entity.state.clone(),
    })
}
