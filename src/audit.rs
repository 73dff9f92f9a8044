//! Append-only audit trail of transition attempts.
//!
//! Records are created once per attempt that reaches validation and are never
//! mutated or deleted. Lock failures never produce a record here; they are
//! infrastructure events logged under the `turnstile::infra` tracing target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entity::{Entity, EntityKey};
use crate::state_machine::TransitionContext;

/// Why a validated attempt was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    InvalidTransition,
    PermissionDenied,
    GuardRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// State changed and the version was bumped.
    Applied,
    /// Target equalled the current state; nothing was written.
    NoOp,
    Rejected { kind: RejectionKind, message: String },
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, AuditOutcome::Rejected { .. })
    }
}

/// Immutable log entry: who moved what from where to where, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub entity: EntityKey,
    /// `None` for the record written when the entity is created.
    pub from_state: Option<String>,
    pub to_state: String,
    pub actor: String,
    pub reason: Option<String>,
    pub comment: Option<String>,
    pub metadata: Map<String, Value>,
    pub version_before: Option<u64>,
    pub version_after: u64,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    fn base(entity: EntityKey, to_state: String, actor: &str, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            from_state: None,
            to_state,
            actor: actor.to_string(),
            reason: None,
            comment: None,
            metadata: Map::new(),
            version_before: None,
            version_after: 0,
            timestamp: Utc::now(),
            outcome,
        }
    }

    /// Record for a freshly inserted entity.
    pub fn created(entity: &Entity, actor: &str) -> Self {
        let mut record = Self::base(
            entity.key.clone(),
            entity.state.clone(),
            actor,
            AuditOutcome::Applied,
        );
        record.version_after = entity.version;
        record
    }

    /// Record for an attempt that read `before` and left the row as `after`.
    pub fn for_change(before: &Entity, after: &Entity, actor: &str, outcome: AuditOutcome) -> Self {
        let mut record = Self::base(before.key.clone(), after.state.clone(), actor, outcome);
        record.from_state = Some(before.state.clone());
        record.version_before = Some(before.version);
        record.version_after = after.version;
        record
    }

    /// Record for an attempt turned down during validation; the row is untouched.
    pub fn rejected(entity: &Entity, target: &str, actor: &str, kind: RejectionKind, message: String) -> Self {
        let mut record = Self::base(
            entity.key.clone(),
            target.to_string(),
            actor,
            AuditOutcome::Rejected { kind, message },
        );
        record.from_state = Some(entity.state.clone());
        record.version_before = Some(entity.version);
        record.version_after = entity.version;
        record
    }

    /// Fold the caller's context (actor, reason, comment, metadata) into the record.
    pub fn with_context(mut self, ctx: &TransitionContext) -> Self {
        self.actor = ctx.actor.clone();
        self.reason = ctx.reason.clone();
        self.comment = ctx.comment.clone();
        self.metadata = ctx.metadata.clone();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Attributes;
    use serde_json::json;

    fn entity(state: &str, version: u64) -> Entity {
        let mut e = Entity::new(EntityKey::new("ticket", "T-1"), state, Attributes::new());
        e.version = version;
        e
    }

    #[test]
    fn created_record_has_no_from_state() {
        let record = AuditRecord::created(&entity("OPEN", 1), "system");
        assert_eq!(record.from_state, None);
        assert_eq!(record.to_state, "OPEN");
        assert_eq!(record.version_after, 1);
        assert!(record.outcome.is_success());
    }

    #[test]
    fn change_record_tracks_both_versions() {
        let record = AuditRecord::for_change(
            &entity("OPEN", 3),
            &entity("IN_PROGRESS", 4),
            "alice",
            AuditOutcome::Applied,
        );
        assert_eq!(record.from_state.as_deref(), Some("OPEN"));
        assert_eq!(record.to_state, "IN_PROGRESS");
        assert_eq!(record.version_before, Some(3));
        assert_eq!(record.version_after, 4);
    }

    #[test]
    fn rejected_record_keeps_version() {
        let record = AuditRecord::rejected(
            &entity("CLOSED", 7),
            "OPEN",
            "bob",
            RejectionKind::InvalidTransition,
            "terminal".into(),
        );
        assert_eq!(record.version_before, Some(7));
        assert_eq!(record.version_after, 7);
        assert!(!record.outcome.is_success());
    }

    #[test]
    fn context_is_folded_in() {
        let ctx = TransitionContext::new("carol")
            .with_reason("sla_breach")
            .with_comment("paging on-call")
            .with_metadata("severity", json!("P1"));
        let record = AuditRecord::created(&entity("OPEN", 1), "system").with_context(&ctx);
        assert_eq!(record.actor, "carol");
        assert_eq!(record.reason.as_deref(), Some("sla_breach"));
        assert_eq!(record.comment.as_deref(), Some("paging on-call"));
        assert_eq!(record.metadata.get("severity"), Some(&json!("P1")));
    }

    #[test]
    fn outcome_serializes_with_result_tag() {
        let outcome = AuditOutcome::Rejected {
            kind: RejectionKind::PermissionDenied,
            message: "no".into(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            value,
            json!({"result": "rejected", "kind": "PermissionDenied", "message": "no"})
        );
        assert_eq!(
            serde_json::to_value(AuditOutcome::NoOp).unwrap(),
            json!({"result": "no_op"})
        );
    }
}
