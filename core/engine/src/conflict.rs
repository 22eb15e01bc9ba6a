//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use polyweave_common::{
    CausalOrder, ConflictId, Error, OperationId, RecordVersion, ResourceKey, Result,
};

/// Built-in merge function name.
pub const STRUCTURAL_MERGE: &str = "structural";

const CLOSED_RETENTION: usize = 1024;

/// Rule for choosing between two concurrent versions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Higher timestamp wins; remote on a tie.
    #[default]
    LastWriteWins,
    /// Lower timestamp wins; remote on a tie.
    FirstWriteWins,
    /// Combine both sides with a registered merge function.
    Merge {
        #[serde(default = "default_merge_function")]
        function: String,
    },
    /// Queue for an external decision.
    Manual,
}

fn default_merge_function() -> String {
    STRUCTURAL_MERGE.to_string()
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::LastWriteWins => write!(f, "last-write-wins"),
            ConflictStrategy::FirstWriteWins => write!(f, "first-write-wins"),
            ConflictStrategy::Merge { function } => write!(f, "merge:{}", function),
            ConflictStrategy::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
    Merged,
    Manual,
}

/// A detected divergence between the local and the remote version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    /// Operation that exposed the conflict.
    pub operation_id: OperationId,
    pub resource: ResourceKey,
    pub local: RecordVersion,
    pub remote: RecordVersion,
    pub resolution: Option<Resolution>,
    pub merged: Option<Value>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolver: Option<String>,
}

impl ConflictRecord {
    pub fn is_closed(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Data the resource should hold once the conflict is closed.
    pub fn winning_data(&self) -> Option<&Value> {
        match self.resolution? {
            Resolution::Local => Some(&self.local.data),
            Resolution::Remote => Some(&self.remote.data),
            Resolution::Merged => self.merged.as_ref(),
            Resolution::Manual => None,
        }
    }
}

/// Outcome of applying a strategy to a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub resolution: Resolution,
    /// Data that should prevail; `None` while the conflict stays open.
    pub data: Option<Value>,
}

/// Decides whether two versions conflict.
#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    use_vector_clocks: bool,
}

impl ConflictDetector {
    pub fn new(use_vector_clocks: bool) -> Self {
        Self { use_vector_clocks }
    }

    /// Whether `local` and `remote` cannot be ordered.
    ///
    /// With vector clocks on both sides, only concurrent clocks conflict.
    /// Otherwise version numbers decide: the local side conflicts when it was
    /// based on an older version than the remote holds.
    pub fn is_conflict(&self, local: &RecordVersion, remote: &RecordVersion) -> bool {
        if self.use_vector_clocks && !local.clock.is_empty() && !remote.clock.is_empty() {
            return local.clock.compare(&remote.clock) == CausalOrder::Concurrent;
        }
        local.version < remote.version
    }

    /// A conflict record when the versions conflict.
    pub fn detect(
        &self,
        operation_id: &OperationId,
        resource: &ResourceKey,
        local: &RecordVersion,
        remote: &RecordVersion,
    ) -> Option<ConflictRecord> {
        if !self.is_conflict(local, remote) {
            return None;
        }

        debug!(resource = %resource, operation = %operation_id, "Conflict detected");
        Some(ConflictRecord {
            id: ConflictId::generate(),
            operation_id: operation_id.clone(),
            resource: resource.clone(),
            local: local.clone(),
            remote: remote.clone(),
            resolution: None,
            merged: None,
            detected_at: Utc::now(),
            resolved_at: None,
            resolver: None,
        })
    }
}

/// Field-wise merge of a local and a remote value.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Merge functions addressable from configuration by name.
#[derive(Clone)]
pub struct MergeRegistry {
    functions: HashMap<String, MergeFn>,
}

impl MergeRegistry {
    /// Registry holding the built-in `structural` merge.
    pub fn new() -> Self {
        let mut functions: HashMap<String, MergeFn> = HashMap::new();
        functions.insert(STRUCTURAL_MERGE.to_string(), Arc::new(structural_merge));
        Self { functions }
    }

    pub fn register(&mut self, name: impl Into<String>, function: MergeFn) -> Result<()> {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(Error::Config(format!(
                "merge function '{}' is already registered",
                name
            )));
        }
        self.functions.insert(name, function);
        Ok(())
    }

    /// # Errors
    /// - `Error::Config` for an unknown name
    pub fn get(&self, name: &str) -> Result<MergeFn> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown merge function '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl Default for MergeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive merge: objects merge key-wise; arrays, scalars and type
/// mismatches take the remote side.
pub fn structural_merge(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut merged: Map<String, Value> = l.clone();
            for (key, remote_value) in r {
                let value = match l.get(key) {
                    Some(local_value) => structural_merge(local_value, remote_value),
                    None => remote_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        _ => remote.clone(),
    }
}

/// Applies strategies to conflicts.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    merges: MergeRegistry,
}

impl ConflictResolver {
    pub fn new(merges: MergeRegistry) -> Self {
        Self { merges }
    }

    pub fn merges(&self) -> &MergeRegistry {
        &self.merges
    }

    /// Check that a strategy can be applied with the registered functions.
    pub fn check(&self, strategy: &ConflictStrategy) -> Result<()> {
        if let ConflictStrategy::Merge { function } = strategy {
            self.merges.get(function)?;
        }
        Ok(())
    }

    /// Pick the prevailing side. Pure in the record and the strategy.
    pub fn resolve(
        &self,
        conflict: &ConflictRecord,
        strategy: &ConflictStrategy,
    ) -> Result<ResolvedConflict> {
        let local = &conflict.local;
        let remote = &conflict.remote;

        let resolved = match strategy {
            ConflictStrategy::LastWriteWins => {
                if local.timestamp > remote.timestamp {
                    side(Resolution::Local, local)
                } else {
                    side(Resolution::Remote, remote)
                }
            }
            ConflictStrategy::FirstWriteWins => {
                if local.timestamp < remote.timestamp {
                    side(Resolution::Local, local)
                } else {
                    side(Resolution::Remote, remote)
                }
            }
            ConflictStrategy::Merge { function } => {
                let merge = self.merges.get(function)?;
                ResolvedConflict {
                    resolution: Resolution::Merged,
                    data: Some(merge(&local.data, &remote.data)),
                }
            }
            ConflictStrategy::Manual => ResolvedConflict {
                resolution: Resolution::Manual,
                data: None,
            },
        };
        Ok(resolved)
    }
}

fn side(resolution: Resolution, version: &RecordVersion) -> ResolvedConflict {
    ResolvedConflict {
        resolution,
        data: Some(version.data.clone()),
    }
}

/// Close a conflict with a final resolution.
pub fn close(
    mut conflict: ConflictRecord,
    resolution: Resolution,
    merged: Option<Value>,
    resolver: impl Into<String>,
) -> ConflictRecord {
    conflict.resolution = Some(resolution);
    conflict.merged = if resolution == Resolution::Merged {
        merged
    } else {
        None
    };
    conflict.resolved_at = Some(Utc::now());
    conflict.resolver = Some(resolver.into());
    conflict
}

/// External decision on a manual conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "data", rename_all = "lowercase")]
pub enum Decision {
    Local,
    Remote,
    Merged(Value),
}

/// An open manual conflict awaiting or carrying a decision.
#[derive(Debug, Clone)]
pub struct QueuedConflict {
    pub record: ConflictRecord,
    /// Provider holding the conflicted resource.
    pub provider: String,
    pub decision: Option<(Decision, String)>,
}

#[derive(Default)]
struct QueueInner {
    open: BTreeMap<ConflictId, QueuedConflict>,
    closed: BTreeMap<ConflictId, ConflictRecord>,
    closed_order: VecDeque<ConflictId>,
}

/// Query surface and holding area for conflicts.
///
/// Open manual conflicts stay here until decided and applied. Closed records
/// are immutable and kept for lookup up to a fixed count.
#[derive(Default)]
pub struct ConflictQueue {
    inner: Mutex<QueueInner>,
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a manual conflict.
    pub fn push(&self, record: ConflictRecord, provider: impl Into<String>) {
        info!(conflict = %record.id, resource = %record.resource, "Queued manual conflict");
        self.inner.lock().open.insert(
            record.id.clone(),
            QueuedConflict {
                record,
                provider: provider.into(),
                decision: None,
            },
        );
    }

    /// Store a closed record.
    pub fn record_closed(&self, record: ConflictRecord) {
        let mut inner = self.inner.lock();
        inner.open.remove(&record.id);
        inner.closed_order.push_back(record.id.clone());
        inner.closed.insert(record.id.clone(), record);
        while inner.closed_order.len() > CLOSED_RETENTION {
            if let Some(oldest) = inner.closed_order.pop_front() {
                inner.closed.remove(&oldest);
            }
        }
    }

    /// Open conflicts in id order.
    pub fn open_conflicts(&self) -> Vec<ConflictRecord> {
        self.inner
            .lock()
            .open
            .values()
            .map(|q| q.record.clone())
            .collect()
    }

    /// Open or closed conflict by id.
    pub fn get(&self, id: &ConflictId) -> Option<ConflictRecord> {
        let inner = self.inner.lock();
        inner
            .open
            .get(id)
            .map(|q| q.record.clone())
            .or_else(|| inner.closed.get(id).cloned())
    }

    /// Record an external decision; applied by the queue processor.
    ///
    /// # Errors
    /// - `Error::NotFound` if no open conflict has this id
    /// - `Error::InvalidState` if a decision was already recorded
    pub fn decide(&self, id: &ConflictId, decision: Decision, resolver: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        let queued = inner
            .open
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("open conflict {}", id)))?;
        if queued.decision.is_some() {
            return Err(Error::InvalidState(format!(
                "conflict {} already has a decision",
                id
            )));
        }
        queued.decision = Some((decision, resolver.into()));
        Ok(())
    }

    /// Conflicts with a decision waiting to be applied.
    pub fn decided(&self) -> Vec<QueuedConflict> {
        self.inner
            .lock()
            .open
            .values()
            .filter(|q| q.decision.is_some())
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use polyweave_common::VectorClock;
    use proptest::prelude::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn version(clock: &[(&str, u64)], secs: i64, data: Value) -> RecordVersion {
        RecordVersion::new(1, VectorClock::from_entries(clock.iter().copied()), at(secs), data)
    }

    fn conflict(local: RecordVersion, remote: RecordVersion) -> ConflictRecord {
        ConflictDetector::new(true)
            .detect(
                &OperationId::generate(),
                &ResourceKey::new("users", Some(&json!({"id": "u1"})), None),
                &local,
                &remote,
            )
            .unwrap()
    }

    #[test]
    fn test_dominance_is_not_conflict() {
        let detector = ConflictDetector::new(true);
        let a = version(&[("a", 2), ("b", 0)], 1, json!({}));
        let b = version(&[("a", 2), ("b", 1)], 1, json!({}));
        assert!(!detector.is_conflict(&a, &b));
        assert!(!detector.is_conflict(&b, &a));
        assert!(!detector.is_conflict(&a, &a));
    }

    #[test]
    fn test_concurrent_is_conflict() {
        let detector = ConflictDetector::new(true);
        let a = version(&[("a", 2), ("b", 0)], 1, json!({}));
        let b = version(&[("a", 1), ("b", 1)], 1, json!({}));
        assert!(detector.is_conflict(&a, &b));
    }

    #[test]
    fn test_version_fallback() {
        let detector = ConflictDetector::new(false);
        let mut local = version(&[("a", 2)], 1, json!({}));
        let mut remote = version(&[("b", 1)], 1, json!({}));

        local.version = 3;
        remote.version = 3;
        assert!(!detector.is_conflict(&local, &remote));

        remote.version = 4;
        assert!(detector.is_conflict(&local, &remote));
    }

    #[test]
    fn test_last_write_wins() {
        let resolver = ConflictResolver::default();
        let record = conflict(
            version(&[("a", 1)], 20, json!({"v": "local"})),
            version(&[("b", 1)], 10, json!({"v": "remote"})),
        );

        let resolved = resolver.resolve(&record, &ConflictStrategy::LastWriteWins).unwrap();
        assert_eq!(resolved.resolution, Resolution::Local);
        assert_eq!(resolved.data, Some(json!({"v": "local"})));

        let resolved = resolver.resolve(&record, &ConflictStrategy::FirstWriteWins).unwrap();
        assert_eq!(resolved.resolution, Resolution::Remote);
    }

    #[test]
    fn test_timestamp_tie_goes_remote() {
        let resolver = ConflictResolver::default();
        let record = conflict(
            version(&[("a", 1)], 10, json!({"v": 1})),
            version(&[("b", 1)], 10, json!({"v": 2})),
        );
        for strategy in [ConflictStrategy::LastWriteWins, ConflictStrategy::FirstWriteWins] {
            let resolved = resolver.resolve(&record, &strategy).unwrap();
            assert_eq!(resolved.resolution, Resolution::Remote);
        }
    }

    #[test]
    fn test_structural_merge() {
        let local = json!({"name": "a", "tags": [1, 2], "profile": {"age": 3, "city": "x"}, "only_local": 1});
        let remote = json!({"name": "b", "tags": [3], "profile": {"age": 4, "zip": "9"}, "only_remote": 2});

        assert_eq!(
            structural_merge(&local, &remote),
            json!({
                "name": "b",
                "tags": [3],
                "profile": {"age": 4, "city": "x", "zip": "9"},
                "only_local": 1,
                "only_remote": 2
            })
        );
        assert_eq!(structural_merge(&json!({"a": 1}), &json!(5)), json!(5));
    }

    #[test]
    fn test_merge_strategy_uses_registry() {
        let mut merges = MergeRegistry::new();
        merges
            .register("local-first", Arc::new(|l: &Value, _r: &Value| l.clone()))
            .unwrap();
        assert!(merges.register(STRUCTURAL_MERGE, Arc::new(structural_merge)).is_err());

        let resolver = ConflictResolver::new(merges);
        let record = conflict(
            version(&[("a", 1)], 1, json!({"v": 1})),
            version(&[("b", 1)], 2, json!({"v": 2})),
        );

        let strategy = ConflictStrategy::Merge {
            function: "local-first".to_string(),
        };
        let resolved = resolver.resolve(&record, &strategy).unwrap();
        assert_eq!(resolved.resolution, Resolution::Merged);
        assert_eq!(resolved.data, Some(json!({"v": 1})));

        let unknown = ConflictStrategy::Merge {
            function: "nope".to_string(),
        };
        assert!(resolver.check(&unknown).is_err());
        assert!(resolver.resolve(&record, &unknown).is_err());
    }

    #[test]
    fn test_strategy_serde() {
        let strategy: ConflictStrategy = serde_json::from_value(json!({"type": "merge"})).unwrap();
        assert_eq!(
            strategy,
            ConflictStrategy::Merge {
                function: STRUCTURAL_MERGE.to_string()
            }
        );
        let strategy: ConflictStrategy =
            serde_json::from_value(json!({"type": "last_write_wins"})).unwrap();
        assert_eq!(strategy, ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn test_queue_decide_and_close() {
        let queue = ConflictQueue::new();
        let record = conflict(
            version(&[("a", 1)], 1, json!({"v": 1})),
            version(&[("b", 1)], 2, json!({"v": 2})),
        );
        let id = record.id.clone();
        queue.push(record.clone(), "primary");

        assert_eq!(queue.open_conflicts().len(), 1);
        assert!(queue.decided().is_empty());

        queue.decide(&id, Decision::Remote, "ops").unwrap();
        assert!(matches!(
            queue.decide(&id, Decision::Local, "ops"),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(queue.decided().len(), 1);

        let closed = close(record, Resolution::Remote, None, "ops");
        queue.record_closed(closed);
        assert_eq!(queue.open_count(), 0);

        let stored = queue.get(&id).unwrap();
        assert!(stored.is_closed());
        assert_eq!(stored.winning_data(), Some(&json!({"v": 2})));
        assert!(matches!(
            queue.decide(&id, Decision::Local, "ops"),
            Err(Error::NotFound(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_resolution_is_deterministic(
            local_ts in 0i64..1000,
            remote_ts in 0i64..1000,
            local_v in any::<i32>(),
            remote_v in any::<i32>(),
        ) {
            let resolver = ConflictResolver::default();
            let record = conflict(
                version(&[("a", 1)], local_ts, json!({"v": local_v})),
                version(&[("b", 1)], remote_ts, json!({"v": remote_v})),
            );

            for strategy in [
                ConflictStrategy::LastWriteWins,
                ConflictStrategy::FirstWriteWins,
                ConflictStrategy::Merge { function: STRUCTURAL_MERGE.to_string() },
            ] {
                let first = resolver.resolve(&record, &strategy).unwrap();
                let second = resolver.resolve(&record, &strategy).unwrap();
                prop_assert_eq!(&first, &second);
            }

            let lww = resolver.resolve(&record, &ConflictStrategy::LastWriteWins).unwrap();
            let expected = if local_ts > remote_ts { Resolution::Local } else { Resolution::Remote };
            prop_assert_eq!(lww.resolution, expected);
        }
    }
}
