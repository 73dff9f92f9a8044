//! Sample ticket workflow and two contention simulations driven by the
//! binary: a race of workers to different targets, and a storm of
//! concurrent appends to one history field.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use crate::audit::AuditRecord;
use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::entity::{Attributes, FieldSelector};
use crate::error::{TableError, TransitionError};
use crate::lock::MemoryLockBackend;
use crate::merge::{self, MergeOutcome};
use crate::permission::{PermissionRequest, PermissionResolver};
use crate::state_machine::{
    StateSnapshot, TransitionContext, TransitionEngine, TransitionResult, TransitionTable, WorkflowState,
};
use crate::store::{EntityStore, MemoryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketState {
    Open,
    InProgress,
    Escalated,
    Resolved,
    Closed,
    Cancelled,
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketState::Open => write!(f, "OPEN"),
            TicketState::InProgress => write!(f, "IN_PROGRESS"),
            TicketState::Escalated => write!(f, "ESCALATED"),
            TicketState::Resolved => write!(f, "RESOLVED"),
            TicketState::Closed => write!(f, "CLOSED"),
            TicketState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl WorkflowState for TicketState {
    const ENTITY_TYPE: &'static str = "ticket";

    fn all() -> &'static [Self] {
        &[
            TicketState::Open,
            TicketState::InProgress,
            TicketState::Escalated,
            TicketState::Resolved,
            TicketState::Closed,
            TicketState::Cancelled,
        ]
    }
}

pub const ESCALATE_PERMISSION: &str = "ticket.escalate";

/// Targets raced by [`race`]; from `IN_PROGRESS` each one rules out the others.
pub const RACE_TARGETS: [TicketState; 3] = [TicketState::Resolved, TicketState::Escalated, TicketState::Cancelled];

pub fn ticket_table() -> Result<TransitionTable<TicketState>, TableError> {
    use TicketState::*;

    TransitionTable::builder()
        .initial(Open)
        .allow(Open, [InProgress, Cancelled])
        .allow(InProgress, [Escalated, Resolved, Cancelled])
        .allow(Escalated, [InProgress])
        .allow(Resolved, [Closed, InProgress])
        .terminal(Closed)
        .terminal(Cancelled)
        .require_permission(Escalated, ESCALATE_PERMISSION)
        .guard(Resolved, "checkpoints_complete", |input| {
            let open = input
                .entity
                .attributes
                .get("open_checkpoints")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if open == 0 {
                Ok(())
            } else {
                Err(format!("{open} checkpoint(s) still open"))
            }
        })
        .build()
}

/// Actors named `lead-*` may escalate; everything else is open.
pub fn ticket_permissions() -> impl PermissionResolver + 'static {
    |req: &PermissionRequest<'_>| match req.permission {
        Some(ESCALATE_PERMISSION) => req.actor.starts_with("lead-"),
        Some(_) => false,
        None => true,
    }
}

/// In-memory coordinator with the ticket table registered.
pub fn ticket_coordinator(
    config: CoordinatorConfig,
) -> Result<(Coordinator<MemoryStore>, TransitionEngine<TicketState, MemoryStore>)> {
    let mut coordinator = Coordinator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLockBackend::new()),
        Arc::new(ticket_permissions()),
        config,
    );
    let engine = coordinator.register(ticket_table()?);
    Ok((coordinator, engine))
}

pub struct WorkerOutcome {
    pub actor: String,
    pub target: TicketState,
    pub result: std::result::Result<TransitionResult<TicketState>, TransitionError<TicketState>>,
}

pub struct RaceReport {
    pub outcomes: Vec<WorkerOutcome>,
    pub final_state: StateSnapshot<TicketState>,
    pub history: Vec<AuditRecord>,
}

impl RaceReport {
    /// Workers whose call changed the ticket.
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Ok(r) if r.applied))
            .count()
    }
}

/// Put ticket `id` in `IN_PROGRESS`, then let `workers` tasks race it to
/// [`RACE_TARGETS`] round-robin.
pub async fn race(engine: &TransitionEngine<TicketState, MemoryStore>, id: &str, workers: usize) -> Result<RaceReport> {
    let system = TransitionContext::system("demo");
    engine.create(id, TicketState::Open, Attributes::new(), &system)?;
    engine
        .transition(id, TicketState::InProgress, &system.clone().with_reason("triaged"))
        .await?;

    let mut tasks = Vec::with_capacity(workers);
    for i in 0..workers {
        let engine = engine.clone();
        let id = id.to_string();
        let target = RACE_TARGETS[i % RACE_TARGETS.len()];
        let actor = if target == TicketState::Escalated {
            format!("lead-{i}")
        } else {
            format!("agent-{i}")
        };
        tasks.push(tokio::spawn(async move {
            let ctx = TransitionContext::new(actor.clone()).with_reason("race");
            let result = engine.transition(&id, target, &ctx).await;
            WorkerOutcome { actor, target, result }
        }));
    }

    let mut outcomes = Vec::with_capacity(workers);
    for task in tasks {
        outcomes.push(task.await.context("race worker panicked")?);
    }

    Ok(RaceReport {
        outcomes,
        final_state: engine.snapshot(id)?,
        history: engine.history(id)?,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub workers: usize,
    pub final_len: usize,
    pub version: u64,
    pub total_attempts: u32,
    pub max_attempts: u32,
}

impl MergeReport {
    pub fn conflicts(&self) -> u32 {
        self.total_attempts
            .saturating_sub(u32::try_from(self.workers).unwrap_or(u32::MAX))
    }
}

/// Create ticket `id` and have `workers` tasks each append one entry to its
/// `history` field concurrently. `on_done` runs once per finished worker.
pub async fn merge_storm<F>(
    coordinator: &Coordinator<MemoryStore>,
    engine: &TransitionEngine<TicketState, MemoryStore>,
    id: &str,
    workers: usize,
    mut on_done: F,
) -> Result<MergeReport>
where
    F: FnMut(&MergeOutcome),
{
    engine.create(id, TicketState::Open, Attributes::new(), &TransitionContext::system("demo"))?;
    let field = FieldSelector::new("history");

    let mut tasks = Vec::with_capacity(workers);
    for i in 0..workers {
        let merger = coordinator.merger().clone();
        let key = engine.key(id);
        let field = field.clone();
        tasks.push(tokio::spawn(async move {
            merger
                .merge(&key, &field, merge::append(json!({"worker": i, "note": "checked in"})))
                .await
        }));
    }

    let mut total_attempts = 0;
    let mut max_attempts = 0;
    for task in tasks {
        let outcome = task.await.context("merge worker panicked")??;
        total_attempts += outcome.attempts;
        max_attempts = max_attempts.max(outcome.attempts);
        on_done(&outcome);
    }

    let entity = coordinator.store().load(&engine.key(id))?;
    let final_len = field
        .get(&entity.attributes)?
        .as_array()
        .map(Vec::len)
        .unwrap_or(0);

    Ok(MergeReport {
        workers,
        final_len,
        version: entity.version,
        total_attempts,
        max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_table_shape() {
        let table = ticket_table().unwrap();
        assert_eq!(table.initial_states(), &[TicketState::Open]);
        assert_eq!(
            table.terminal_states(),
            vec![TicketState::Closed, TicketState::Cancelled]
        );
        assert_eq!(
            table.required_permission(TicketState::Escalated),
            Some(ESCALATE_PERMISSION)
        );
        assert_eq!(table.guard_names(TicketState::Resolved), vec!["checkpoints_complete"]);
    }

    #[test]
    fn race_targets_exclude_each_other() {
        let table = ticket_table().unwrap();
        for winner in RACE_TARGETS {
            assert!(table.allows(TicketState::InProgress, winner));
            for loser in RACE_TARGETS.iter().filter(|t| **t != winner) {
                assert!(!table.allows(winner, *loser), "{winner} -> {loser}");
            }
        }
    }

    #[test]
    fn only_leads_escalate() {
        fn request(actor: &str) -> PermissionRequest<'_> {
            PermissionRequest {
                actor,
                entity_type: "ticket",
                entity_id: "T-1",
                target_state: "ESCALATED",
                permission: Some(ESCALATE_PERMISSION),
            }
        }
        let resolver = ticket_permissions();
        assert!(resolver.can_transition(&request("lead-1")));
        assert!(!resolver.can_transition(&request("agent-1")));
    }

    #[test]
    fn conflicts_never_truncate_worker_count() {
        let report = MergeReport {
            workers: usize::MAX,
            final_len: 0,
            version: 1,
            total_attempts: 7,
            max_attempts: 1,
        };
        assert_eq!(report.conflicts(), 0);

        let report = MergeReport {
            workers: 4,
            total_attempts: 9,
            ..report
        };
        assert_eq!(report.conflicts(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn race_applies_exactly_one_change() {
        let (_coordinator, engine) = ticket_coordinator(CoordinatorConfig::default()).unwrap();
        let report = race(&engine, "T-1", 9).await.unwrap();

        assert_eq!(report.applied(), 1);
        assert_eq!(report.final_state.version, 3);
        assert!(RACE_TARGETS.contains(&report.final_state.state));
        for outcome in &report.outcomes {
            match &outcome.result {
                Ok(r) => assert_eq!(r.to, report.final_state.state),
                Err(err) => assert!(matches!(err, TransitionError::InvalidTransition { .. })),
            }
        }
        // created + triaged + one record per worker
        assert_eq!(report.history.len(), 2 + 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn merge_storm_keeps_every_entry() {
        let (coordinator, engine) = ticket_coordinator(CoordinatorConfig::default()).unwrap();
        let mut done = 0;
        let report = merge_storm(&coordinator, &engine, "T-2", 16, |_| done += 1)
            .await
            .unwrap();

        assert_eq!(done, 16);
        assert_eq!(report.final_len, 16);
        assert_eq!(report.version, 17);
        assert!(report.total_attempts >= 16);
        assert_eq!(coordinator.store().audit_trail(&engine.key("T-2")).unwrap().len(), 1);
    }
}
