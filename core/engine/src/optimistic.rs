//! Optimistic update tracking.
//!
//! A write marked optimistic is projected onto cached reads before the backend
//! confirms it. The tracker keeps the prior value of every cache entry the
//! projection rewrote so the projection can be undone.
//!
//! ```text
//! pending --mark_applied--> applied --confirm--> confirmed
//!    |                         |
//!    +-------rollback----------+--> rolled-back   (failure or TTL expiry)
//! ```

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use polyweave_common::{
    matches_filter, CrudOperation, Error, OperationId, OperationKind, OptimisticId, ResourceKey,
    Result, PRIMARY_KEY_FIELD,
};

use crate::cache::{collection_prefix, CacheRevert, ResultCache};
use crate::events::{EngineEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticState {
    /// Recorded; cache not yet touched.
    Pending,
    /// Speculative change visible in the cache.
    Applied,
    Confirmed,
    RolledBack,
}

impl OptimisticState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OptimisticState::Confirmed | OptimisticState::RolledBack)
    }
}

#[derive(Debug, Clone)]
pub struct OptimisticRecord {
    pub id: OptimisticId,
    pub operation_id: OperationId,
    pub resource: ResourceKey,
    /// The write being applied ahead of confirmation.
    pub operation: CrudOperation,
    /// Undo record for the cache entries the projection rewrote; set once
    /// applied and dropped on confirmation.
    pub rollback: Option<CacheRevert>,
    pub state: OptimisticState,
    pub created_at: Instant,
    pub ttl: Duration,
    pub closed_at: Option<Instant>,
    /// Why the record was rolled back.
    pub reason: Option<String>,
}

impl OptimisticRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.state.is_terminal() && now.duration_since(self.created_at) >= self.ttl
    }
}

/// Registry of optimistic updates.
///
/// Safe for concurrent use. Terminal records stay queryable for the retention
/// period and are pruned by [`OptimisticTracker::expire_stale`].
pub struct OptimisticTracker {
    records: DashMap<OptimisticId, OptimisticRecord>,
    cache: Arc<ResultCache>,
    events: EventBus,
    retention: Duration,
}

impl OptimisticTracker {
    pub fn new(cache: Arc<ResultCache>, events: EventBus, retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            cache,
            events,
            retention,
        }
    }

    /// Record a pending optimistic update and return its id.
    pub fn apply(&self, operation: &CrudOperation, ttl: Duration) -> OptimisticId {
        let id = OptimisticId::generate();
        let record = OptimisticRecord {
            id: id.clone(),
            operation_id: operation.id.clone(),
            resource: operation.resource_key(),
            operation: operation.clone(),
            rollback: None,
            state: OptimisticState::Pending,
            created_at: Instant::now(),
            ttl,
            closed_at: None,
            reason: None,
        };

        debug!(id = %id, operation = %operation.id, ttl = ?ttl, "Recorded optimistic update");
        self.records.insert(id.clone(), record);
        id
    }

    /// Project the write onto cached reads of its collection.
    ///
    /// # Errors
    /// - `Error::NotFound` for an unknown id
    /// - `Error::InvalidState` unless the record is pending
    pub fn mark_applied(&self, id: &OptimisticId) -> Result<usize> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("optimistic update {}", id)))?;
        if record.state != OptimisticState::Pending {
            return Err(Error::InvalidState(format!(
                "optimistic update {} is {:?}, not pending",
                id, record.state
            )));
        }

        let operation = &record.operation;
        let revert = self
            .cache
            .update_prefix(&collection_prefix(&operation.collection), |value, filter| {
                project_write(value, filter, operation)
            });
        let touched = revert.len();
        record.rollback = Some(revert);
        record.state = OptimisticState::Applied;
        let operation_id = record.operation_id.clone();
        drop(record);

        debug!(id = %id, entries = touched, "Applied optimistic update");
        self.events.publish(EngineEvent::OptimisticApplied {
            id: id.clone(),
            operation_id,
        });
        Ok(touched)
    }

    /// Mark the update confirmed and drop its undo record.
    pub fn confirm(&self, id: &OptimisticId) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("optimistic update {}", id)))?;
        if record.state != OptimisticState::Applied {
            return Err(Error::InvalidState(format!(
                "optimistic update {} is {:?}, not applied",
                id, record.state
            )));
        }

        record.state = OptimisticState::Confirmed;
        record.rollback = None;
        record.closed_at = Some(Instant::now());
        drop(record);

        debug!(id = %id, "Confirmed optimistic update");
        self.events
            .publish(EngineEvent::OptimisticConfirmed { id: id.clone() });
        Ok(())
    }

    /// Undo the cache projection and close the record.
    ///
    /// Entries rewritten or invalidated by later writes are left to those
    /// writes.
    pub fn rollback(&self, id: &OptimisticId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("optimistic update {}", id)))?;
        if record.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "optimistic update {} is already {:?}",
                id, record.state
            )));
        }

        if record.state == OptimisticState::Applied {
            if let Some(revert) = &record.rollback {
                let restored = self.cache.revert(revert);
                debug!(id = %id, entries = restored, "Reverted optimistic projection");
            }
        }
        record.state = OptimisticState::RolledBack;
        record.rollback = None;
        record.closed_at = Some(Instant::now());
        record.reason = Some(reason.clone());
        drop(record);

        info!(id = %id, reason = %reason, "Rolled back optimistic update");
        self.events.publish(EngineEvent::OptimisticRolledBack {
            id: id.clone(),
            reason,
        });
        Ok(())
    }

    /// Roll back every open record whose TTL elapsed by `now`, and prune
    /// terminal records past retention. Returns the rolled-back ids.
    pub fn expire_stale(&self, now: Instant) -> Vec<OptimisticId> {
        let expired: Vec<OptimisticId> = self
            .records
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id.clone())
            .collect();

        let mut rolled_back = Vec::with_capacity(expired.len());
        for id in expired {
            match self.rollback(&id, "ttl expired") {
                Ok(()) => rolled_back.push(id),
                // Confirmed or rolled back concurrently.
                Err(e) => debug!(id = %id, error = %e, "Skipped expiry"),
            }
        }

        let retention = self.retention;
        self.records.retain(|_, r| {
            r.closed_at
                .map(|closed| now.saturating_duration_since(closed) < retention)
                .unwrap_or(true)
        });

        if !rolled_back.is_empty() {
            warn!(count = rolled_back.len(), "Expired optimistic updates");
        }
        rolled_back
    }

    pub fn status(&self, id: &OptimisticId) -> Option<OptimisticState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn record(&self, id: &OptimisticId) -> Option<OptimisticRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Records not yet confirmed or rolled back.
    pub fn open_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.state.is_terminal())
            .count()
    }
}

/// Apply a write to one cached read result.
///
/// Cached values are arrays of documents. A create is appended when the
/// document matches the read's filter; updates and deletes touch the elements
/// matching the write's filter.
fn project_write(value: &mut Value, read_filter: Option<&Value>, operation: &CrudOperation) -> bool {
    let Value::Array(docs) = value else {
        return false;
    };

    match operation.kind {
        OperationKind::Create => {
            let Some(data) = &operation.data else {
                return false;
            };
            if !matches_filter(data, read_filter) {
                return false;
            }
            docs.push(data.clone());
            true
        }
        OperationKind::Update => {
            let Some(patch) = &operation.data else {
                return false;
            };
            let mut changed = false;
            for doc in docs.iter_mut() {
                if !matches_filter(doc, operation.filter.as_ref()) {
                    continue;
                }
                if operation.options.replace {
                    let id = doc.get(PRIMARY_KEY_FIELD).cloned();
                    *doc = patch.clone();
                    if let (Some(id), Value::Object(map)) = (id, &mut *doc) {
                        map.insert(PRIMARY_KEY_FIELD.to_string(), id);
                    }
                } else if let (Value::Object(target), Value::Object(fields)) = (&mut *doc, patch) {
                    for (k, v) in fields {
                        target.insert(k.clone(), v.clone());
                    }
                }
                changed = true;
                if !operation.options.multi {
                    break;
                }
            }
            changed
        }
        OperationKind::Delete => {
            let before = docs.len();
            let mut removed_one = false;
            docs.retain(|doc| {
                let remove = matches_filter(doc, operation.filter.as_ref())
                    && (operation.options.multi || !removed_one);
                if remove {
                    removed_one = true;
                }
                !remove
            });
            docs.len() != before
        }
        OperationKind::Read | OperationKind::Batch => false,
    }
}

/// Body of the provisional result returned for an optimistic write.
pub fn provisional_data(operation: &CrudOperation) -> Value {
    match operation.kind {
        OperationKind::Delete => Value::Array(Vec::new()),
        _ => operation
            .data
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{cache_key, CacheConfig};
    use serde_json::json;

    fn tracker() -> (OptimisticTracker, Arc<ResultCache>) {
        let cache = Arc::new(ResultCache::new(CacheConfig::default()));
        let tracker = OptimisticTracker::new(cache.clone(), EventBus::default(), Duration::from_secs(60));
        (tracker, cache)
    }

    fn seed_read(cache: &ResultCache, filter: Value, docs: Value) -> String {
        let read = CrudOperation::read("users", filter.clone());
        let key = cache_key(&read);
        cache.put(key.clone(), docs, Some(filter), None);
        key
    }

    #[test]
    fn test_apply_confirm() {
        let (tracker, cache) = tracker();
        let key = seed_read(&cache, json!({}), json!([{"id": "u1", "n": 1}]));

        let op = CrudOperation::update("users", json!({"id": "u1"}), json!({"n": 2}));
        let id = tracker.apply(&op, Duration::from_secs(5));
        assert_eq!(tracker.status(&id), Some(OptimisticState::Pending));

        assert_eq!(tracker.mark_applied(&id).unwrap(), 1);
        assert_eq!(cache.get(&key), Some(json!([{"id": "u1", "n": 2}])));

        tracker.confirm(&id).unwrap();
        let record = tracker.record(&id).unwrap();
        assert_eq!(record.state, OptimisticState::Confirmed);
        assert!(record.rollback.is_none());
        assert!(tracker.rollback(&id, "late").is_err());
    }

    #[test]
    fn test_rollback_restores_cache() {
        let (tracker, cache) = tracker();
        let key = seed_read(&cache, json!({}), json!([{"id": "u1"}, {"id": "u2"}]));
        let before = cache.entry(&key).unwrap();

        let op = CrudOperation::delete("users", json!({"id": "u2"}));
        let id = tracker.apply(&op, Duration::from_secs(5));
        tracker.mark_applied(&id).unwrap();
        assert_eq!(cache.entry(&key).unwrap().value, json!([{"id": "u1"}]));

        tracker.rollback(&id, "backend rejected").unwrap();
        assert_eq!(cache.entry(&key).unwrap(), before);
        assert_eq!(tracker.status(&id), Some(OptimisticState::RolledBack));
        assert_eq!(
            tracker.record(&id).unwrap().reason.as_deref(),
            Some("backend rejected")
        );
    }

    #[test]
    fn test_create_respects_read_filter() {
        let (tracker, cache) = tracker();
        let admins = seed_read(&cache, json!({"role": "admin"}), json!([]));
        let all = seed_read(&cache, json!({}), json!([]));

        let op = CrudOperation::create("users", json!({"id": "u3", "role": "guest"}));
        let id = tracker.apply(&op, Duration::from_secs(5));
        tracker.mark_applied(&id).unwrap();

        assert_eq!(cache.get(&admins), Some(json!([])));
        assert_eq!(cache.get(&all), Some(json!([{"id": "u3", "role": "guest"}])));
    }

    #[test]
    fn test_confirm_requires_applied() {
        let (tracker, _cache) = tracker();
        let op = CrudOperation::create("users", json!({"id": "u1"}));
        let id = tracker.apply(&op, Duration::from_secs(5));
        assert!(matches!(tracker.confirm(&id), Err(Error::InvalidState(_))));
        assert!(tracker.confirm(&OptimisticId::generate()).is_err());
    }

    #[test]
    fn test_expire_stale() {
        let (tracker, cache) = tracker();
        let key = seed_read(&cache, json!({}), json!([]));

        let op = CrudOperation::create("users", json!({"id": "u1"}));
        let id = tracker.apply(&op, Duration::from_millis(50));
        tracker.mark_applied(&id).unwrap();
        assert_eq!(cache.get(&key), Some(json!([{"id": "u1"}])));

        assert!(tracker.expire_stale(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(tracker.expire_stale(later), vec![id.clone()]);
        assert_eq!(tracker.status(&id), Some(OptimisticState::RolledBack));
        assert_eq!(cache.get(&key), Some(json!([])));
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn test_terminal_records_pruned_after_retention() {
        let cache = Arc::new(ResultCache::new(CacheConfig::default()));
        let tracker = OptimisticTracker::new(cache.clone(), EventBus::default(), Duration::from_millis(10));

        let op = CrudOperation::create("users", json!({"id": "u1"}));
        let id = tracker.apply(&op, Duration::from_secs(5));
        tracker.mark_applied(&id).unwrap();
        tracker.confirm(&id).unwrap();

        tracker.expire_stale(Instant::now() + Duration::from_millis(50));
        assert!(tracker.status(&id).is_none());
    }

    #[test]
    fn test_rollback_keeps_unrelated_and_newer_entries() {
        let (tracker, cache) = tracker();
        let u1 = seed_read(&cache, json!({"id": "u1"}), json!([{"id": "u1", "n": 1}]));
        let all = seed_read(&cache, json!({}), json!([]));

        let op = CrudOperation::create("users", json!({"id": "u2"}));
        let id = tracker.apply(&op, Duration::from_secs(5));
        assert_eq!(tracker.mark_applied(&id).unwrap(), 1);

        // A confirmed write elsewhere in the collection clears its reads.
        cache.invalidate_by_prefix("users:");
        cache.put(u1.clone(), json!([{"id": "u1", "n": 2}]), Some(json!({"id": "u1"})), None);

        tracker.rollback(&id, "backend rejected").unwrap();
        assert_eq!(cache.get(&u1), Some(json!([{"id": "u1", "n": 2}])));
        assert!(!cache.contains(&all));
    }
}
