//! Lock-free read-modify-write on one attribute field.
//!
//! [`AtomicMerger::update`] reads the field and version, runs a pure merge
//! function, and writes through the [`VersionGuard`]. A version conflict means
//! another writer landed first: back off with jitter, re-read, and re-run the
//! merge on the fresh value. No update is ever silently dropped.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::entity::{EntityKey, FieldSelector};
use crate::error::{MergeError, VersionError};
use crate::retry::RetryConfig;
use crate::store::EntityStore;
use crate::version::VersionGuard;

/// Value written by a successful merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub value: Value,
    pub version: u64,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// False when the merge produced the value already stored.
    pub applied: bool,
}

pub struct AtomicMerger<S> {
    guard: VersionGuard<S>,
    retry: RetryConfig,
}

impl<S> Clone for AtomicMerger<S> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            retry: self.retry,
        }
    }
}

impl<S: EntityStore> AtomicMerger<S> {
    pub fn new(store: Arc<S>, retry: RetryConfig) -> Self {
        Self {
            guard: VersionGuard::new(store),
            retry,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    /// Merge with the configured retry budget.
    pub async fn merge<F>(&self, key: &EntityKey, field: &FieldSelector, merge: F) -> Result<MergeOutcome, MergeError>
    where
        F: FnMut(&Value) -> Value + Send,
    {
        self.update(key, field, merge, self.retry.max_retries).await
    }

    /// Apply `merge` to `field` of `key`, retrying up to `max_retries` times on
    /// version conflicts.
    ///
    /// `merge` may run once per attempt and must be free of side effects.
    pub async fn update<F>(
        &self,
        key: &EntityKey,
        field: &FieldSelector,
        mut merge: F,
        max_retries: u32,
    ) -> Result<MergeOutcome, MergeError>
    where
        F: FnMut(&Value) -> Value + Send,
    {
        let max_attempts = max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let entity = self.guard.store().load(key)?;
            let current = field
                .get(&entity.attributes)
                .map_err(|source| MergeError::Selector {
                    key: key.clone(),
                    source,
                })?;
            let merged = merge(&current);

            if merged == current {
                return Ok(MergeOutcome {
                    value: merged,
                    version: entity.version,
                    attempts: attempt,
                    applied: false,
                });
            }

            let swap = self.guard.check_and_swap(key, entity.version, |txn| {
                field.set(&mut txn.entity_mut().attributes, merged.clone())
            });
            match swap {
                Ok(swap) => {
                    // The selector already resolved on this row, so set cannot fail here.
                    swap.output.map_err(|source| MergeError::Selector {
                        key: key.clone(),
                        source,
                    })?;
                    debug!(%key, %field, attempts = attempt, version = swap.new_version, "merge applied");
                    return Ok(MergeOutcome {
                        value: merged,
                        version: swap.new_version,
                        attempts: attempt,
                        applied: swap.applied,
                    });
                }
                Err(VersionError::ConcurrentModification { actual, .. }) => {
                    if attempt >= max_attempts {
                        warn!(%key, %field, attempts = attempt, "merge retries exhausted");
                        return Err(MergeError::RetriesExhausted {
                            key: key.clone(),
                            field: field.to_string(),
                            attempts: attempt,
                        });
                    }
                    debug!(%key, %field, attempt, seen = entity.version, actual, "merge conflict, retrying");
                    let delay = self.retry.jittered_delay(attempt);
                    tokio::time::sleep(delay).await;
                }
                Err(VersionError::Store(err)) => return Err(err.into()),
            }
        }
    }
}

/// Merge that appends `item` to a list field (absent counts as empty).
pub fn append(item: Value) -> impl FnMut(&Value) -> Value + Send + 'static {
    move |current| {
        let mut list = match current {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        list.push(item.clone());
        Value::Array(list)
    }
}

/// Merge that adds `by` to an integer counter field (absent counts as 0).
pub fn increment(by: i64) -> impl FnMut(&Value) -> Value + Send + 'static {
    move |current| {
        let base = current.as_i64().unwrap_or(0);
        Value::from(base.saturating_add(by))
    }
}

/// Merge that sets `name` inside an object field, keeping other keys.
pub fn insert_key(name: impl Into<String>, value: Value) -> impl FnMut(&Value) -> Value + Send + 'static {
    let name = name.into();
    move |current| {
        let mut map = match current {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        map.insert(name.clone(), value.clone());
        Value::Object(map)
    }
}
