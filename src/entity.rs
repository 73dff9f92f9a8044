//! Workflow entities as the coordination core sees them.
//!
//! The store persists the state as its display code; typed access happens in
//! the [`state_machine`](crate::state_machine) layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SelectorError;

/// Semi-structured auxiliary fields of an entity.
pub type Attributes = Map<String, Value>;

/// Stable identity of an entity: its type plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Lock resource key, `{entity_type}:{entity_id}`.
    pub fn resource_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// A persisted workflow object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub state: String,
    /// Incremented exactly once per effective write.
    pub version: u64,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(key: EntityKey, state: impl Into<String>, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            key,
            state: state.into(),
            version: 1,
            attributes,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when `other` carries the same business content (state and attributes).
    pub fn same_content(&self, other: &Entity) -> bool {
        self.state == other.state && self.attributes == other.attributes
    }
}

/// Path into an entity's attribute map, e.g. `history` or `counters.views`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSelector {
    segments: Vec<String>,
}

impl FieldSelector {
    /// Selector for one top-level attribute, taken literally: dots are not
    /// split and an empty name addresses the `""` key. Use
    /// [`path`](Self::path) or `parse` for validated, dotted paths.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            segments: vec![field.into()],
        }
    }

    pub fn path<I, T>(segments: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(SelectorError::Empty);
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Current value at the selector, `Null` when any segment is absent.
    pub fn get(&self, attributes: &Attributes) -> Result<Value, SelectorError> {
        let (last, parents) = self.split();
        let mut current = attributes;
        for (depth, segment) in parents.iter().enumerate() {
            match current.get(segment) {
                None | Some(Value::Null) => return Ok(Value::Null),
                Some(Value::Object(map)) => current = map,
                Some(_) => return Err(self.not_object(depth)),
            }
        }
        Ok(current.get(last).cloned().unwrap_or(Value::Null))
    }

    /// Write `value` at the selector, creating intermediate objects as needed.
    pub fn set(&self, attributes: &mut Attributes, value: Value) -> Result<(), SelectorError> {
        let (last, parents) = self.split();
        let mut current = attributes;
        for (depth, segment) in parents.iter().enumerate() {
            let slot = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => return Err(self.not_object(depth)),
            };
        }
        current.insert(last.clone(), value);
        Ok(())
    }

    fn split(&self) -> (&String, &[String]) {
        // Constructors guarantee at least one segment.
        let (last, parents) = self
            .segments
            .split_last()
            .expect("field selector has at least one segment");
        (last, parents)
    }

    fn not_object(&self, depth: usize) -> SelectorError {
        SelectorError::NotAnObject {
            path: self.segments[..=depth].join("."),
        }
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::path(s.split('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn resource_key_is_type_and_id() {
        let key = EntityKey::new("ticket", "T-1");
        assert_eq!(key.resource_key(), "ticket:T-1");
        assert_ne!(
            EntityKey::new("task", "T-1").resource_key(),
            key.resource_key()
        );
    }

    #[test]
    fn new_entity_starts_at_version_one() {
        let entity = Entity::new(EntityKey::new("task", "1"), "OPEN", Attributes::new());
        assert_eq!(entity.version, 1);
        assert_eq!(entity.created_at, entity.updated_at);
    }

    #[test]
    fn get_missing_field_is_null() {
        let selector: FieldSelector = "counters.views".parse().unwrap();
        assert_eq!(selector.get(&Attributes::new()).unwrap(), Value::Null);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let selector: FieldSelector = "counters.views".parse().unwrap();
        let mut map = Attributes::new();
        selector.set(&mut map, json!(3)).unwrap();
        assert_eq!(Value::Object(map), json!({"counters": {"views": 3}}));
    }

    #[test]
    fn traversing_a_scalar_fails() {
        let selector: FieldSelector = "history.count".parse().unwrap();
        let mut map = attrs(json!({"history": [1, 2]}));
        let err = selector.set(&mut map, json!(1)).unwrap_err();
        assert_eq!(
            err,
            SelectorError::NotAnObject {
                path: "history".into()
            }
        );
        assert!(selector.get(&map).is_err());
    }

    #[test]
    fn empty_selector_rejected() {
        assert_eq!("".parse::<FieldSelector>(), Err(SelectorError::Empty));
        assert_eq!("a..b".parse::<FieldSelector>(), Err(SelectorError::Empty));
    }

    #[test]
    fn new_takes_the_name_literally() {
        let mut map = Attributes::new();
        FieldSelector::new("a.b").set(&mut map, json!(1)).unwrap();
        assert_eq!(Value::Object(map.clone()), json!({"a.b": 1}));

        let blank = FieldSelector::new("");
        blank.set(&mut map, json!(2)).unwrap();
        assert_eq!(blank.get(&map).unwrap(), json!(2));
        assert_eq!(map[""], json!(2));
    }

    #[test]
    fn same_content_ignores_version_and_timestamps() {
        let a = Entity::new(EntityKey::new("task", "1"), "OPEN", Attributes::new());
        let mut b = a.clone();
        b.version = 9;
        b.updated_at = Utc::now();
        assert!(a.same_content(&b));
        b.state = "DONE".into();
        assert!(!a.same_content(&b));
    }

    proptest! {
        #[test]
        fn set_then_get_returns_value(
            segments in proptest::collection::vec("[a-z]{1,6}", 1..4),
            n in any::<i64>(),
        ) {
            let selector = FieldSelector::path(segments.clone()).unwrap();
            let mut map = Attributes::new();
            selector.set(&mut map, json!(n)).unwrap();
            prop_assert_eq!(selector.get(&map).unwrap(), json!(n));
            prop_assert_eq!(selector.to_string(), segments.join("."));
        }
    }
}
