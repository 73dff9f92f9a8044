//! Authorization boundary. Policy lives in the surrounding application; the
//! engine only asks a yes/no question.

use std::collections::{HashMap, HashSet};

/// One authorization question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionRequest<'a> {
    pub actor: &'a str,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub target_state: &'a str,
    /// Permission the transition table requires for `target_state`, if any.
    pub permission: Option<&'a str>,
}

pub trait PermissionResolver: Send + Sync {
    fn can_transition(&self, request: &PermissionRequest<'_>) -> bool;
}

impl<F> PermissionResolver for F
where
    F: Fn(&PermissionRequest<'_>) -> bool + Send + Sync,
{
    fn can_transition(&self, request: &PermissionRequest<'_>) -> bool {
        self(request)
    }
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionResolver for AllowAll {
    fn can_transition(&self, _request: &PermissionRequest<'_>) -> bool {
        true
    }
}

/// Fixed actor -> permissions map. Targets without a required permission are
/// open to every actor.
#[derive(Debug, Clone, Default)]
pub struct StaticGrants {
    grants: HashMap<String, HashSet<String>>,
}

impl StaticGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, actor: impl Into<String>, permission: impl Into<String>) -> Self {
        self.grants
            .entry(actor.into())
            .or_default()
            .insert(permission.into());
        self
    }
}

impl PermissionResolver for StaticGrants {
    fn can_transition(&self, request: &PermissionRequest<'_>) -> bool {
        match request.permission {
            None => true,
            Some(permission) => self
                .grants
                .get(request.actor)
                .is_some_and(|held| held.contains(permission)),
        }
    }
}
