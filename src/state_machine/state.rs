use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use super::context::TransitionContext;
use crate::entity::Entity;
use crate::error::TableError;

/// A closed set of lifecycle states for one entity type.
///
/// `Display` must produce the persisted code of each state and be unique
/// across [`all`](WorkflowState::all).
pub trait WorkflowState:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Entity type name, first half of every lock resource key.
    const ENTITY_TYPE: &'static str;

    /// Every state, in declaration order.
    fn all() -> &'static [Self];

    /// Parse a persisted state code.
    fn from_code(code: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.to_string() == code)
    }
}

/// What a guard predicate sees: the row as re-read under the lock.
pub struct GuardInput<'a, W> {
    pub entity: &'a Entity,
    pub current: W,
    pub target: W,
    pub context: &'a TransitionContext,
}

/// Business rule evaluated before entering `target`; `Err` carries the reason.
pub type GuardFn<W> = Arc<dyn Fn(&GuardInput<'_, W>) -> Result<(), String> + Send + Sync>;

struct NamedGuard<W> {
    name: String,
    check: GuardFn<W>,
}

struct TargetRule<W> {
    permission: Option<String>,
    guards: Vec<NamedGuard<W>>,
}

impl<W> Default for TargetRule<W> {
    fn default() -> Self {
        Self {
            permission: None,
            guards: Vec::new(),
        }
    }
}

/// Immutable map of allowed moves for one entity type, plus per-target
/// permission and guard requirements. Build once at startup.
pub struct TransitionTable<W> {
    allowed: HashMap<W, Vec<W>>,
    initial: Vec<W>,
    rules: HashMap<W, TargetRule<W>>,
}

impl<W: WorkflowState> TransitionTable<W> {
    pub fn builder() -> TableBuilder<W> {
        TableBuilder {
            allowed: HashMap::new(),
            initial: Vec::new(),
            terminal: Vec::new(),
            rules: HashMap::new(),
        }
    }

    pub fn entity_type(&self) -> &'static str {
        W::ENTITY_TYPE
    }

    /// Legal targets from `state`; empty for terminal states.
    pub fn allowed(&self, state: W) -> &[W] {
        self.allowed.get(&state).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn allows(&self, from: W, to: W) -> bool {
        self.allowed(from).contains(&to)
    }

    pub fn is_initial(&self, state: W) -> bool {
        self.initial.contains(&state)
    }

    pub fn is_terminal(&self, state: W) -> bool {
        self.allowed(state).is_empty()
    }

    pub fn initial_states(&self) -> &[W] {
        &self.initial
    }

    pub fn terminal_states(&self) -> Vec<W> {
        W::all()
            .iter()
            .copied()
            .filter(|s| self.is_terminal(*s))
            .collect()
    }

    pub fn required_permission(&self, target: W) -> Option<&str> {
        self.rules.get(&target)?.permission.as_deref()
    }

    /// Run every guard on `input.target`; the first rejection wins.
    pub fn check_guards(&self, input: &GuardInput<'_, W>) -> Result<(), (String, String)> {
        let Some(rule) = self.rules.get(&input.target) else {
            return Ok(());
        };
        for guard in &rule.guards {
            (guard.check)(input).map_err(|reason| (guard.name.clone(), reason))?;
        }
        Ok(())
    }

    pub fn guard_names(&self, target: W) -> Vec<&str> {
        self.rules
            .get(&target)
            .map(|rule| rule.guards.iter().map(|g| g.name.as_str()).collect())
            .unwrap_or_default()
    }
}

impl<W: WorkflowState> fmt::Debug for TransitionTable<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let edges: Vec<(W, &[W])> = W::all().iter().map(|s| (*s, self.allowed(*s))).collect();
        f.debug_struct("TransitionTable")
            .field("entity_type", &W::ENTITY_TYPE)
            .field("initial", &self.initial)
            .field("allowed", &edges)
            .finish_non_exhaustive()
    }
}

pub struct TableBuilder<W> {
    allowed: HashMap<W, Vec<W>>,
    initial: Vec<W>,
    terminal: Vec<W>,
    rules: HashMap<W, TargetRule<W>>,
}

impl<W: WorkflowState> TableBuilder<W> {
    /// Declare a state entities may be created in.
    pub fn initial(mut self, state: W) -> Self {
        if !self.initial.contains(&state) {
            self.initial.push(state);
        }
        self
    }

    /// Allow `from -> to` for each target.
    pub fn allow(mut self, from: W, targets: impl IntoIterator<Item = W>) -> Self {
        let entry = self.allowed.entry(from).or_default();
        for to in targets {
            if to != from && !entry.contains(&to) {
                entry.push(to);
            }
        }
        self
    }

    /// Declare `state` terminal; `build` fails if it has outgoing transitions.
    pub fn terminal(mut self, state: W) -> Self {
        self.terminal.push(state);
        self
    }

    pub fn require_permission(mut self, target: W, permission: impl Into<String>) -> Self {
        self.rules.entry(target).or_default().permission = Some(permission.into());
        self
    }

    pub fn guard<F>(mut self, target: W, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&GuardInput<'_, W>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.rules.entry(target).or_default().guards.push(NamedGuard {
            name: name.into(),
            check: Arc::new(check),
        });
        self
    }

    pub fn build(mut self) -> Result<TransitionTable<W>, TableError> {
        let entity_type = W::ENTITY_TYPE.to_string();
        self.allowed.retain(|_, targets| !targets.is_empty());

        let mut codes = HashSet::new();
        for state in W::all() {
            let code = state.to_string();
            if !codes.insert(code.clone()) {
                return Err(TableError::DuplicateCode { entity_type, code });
            }
        }
        if self.initial.is_empty() {
            return Err(TableError::NoInitialState { entity_type });
        }
        if let Some(state) = self
            .terminal
            .iter()
            .find(|s| self.allowed.contains_key(*s))
        {
            return Err(TableError::TerminalWithTargets {
                entity_type,
                state: state.to_string(),
            });
        }
        if W::all().iter().all(|s| self.allowed.contains_key(s)) {
            return Err(TableError::NoTerminalState { entity_type });
        }

        Ok(TransitionTable {
            allowed: self.allowed,
            initial: self.initial,
            rules: self.rules,
        })
    }
}
