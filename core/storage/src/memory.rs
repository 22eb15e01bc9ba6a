//! In-memory backend adapter.
//!
//! Stands in for any backend kind in tests, demos and the CLI. Records live in
//! per-collection maps keyed by their `id` field and carry a version number,
//! a vector clock and the timestamp of the last write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use polyweave_common::{
    matches_filter, CrudOperation, Error, OperationKind, RecordVersion, Result, SortKey,
    VectorClock, PRIMARY_KEY_FIELD,
};

use crate::adapter::{BackendAdapter, RawResult};
use crate::descriptor::ConnectionConfig;

/// Failure injected into the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Transient error, eligible for retry.
    Recoverable,
    /// Non-retryable backend rejection.
    Fatal,
    /// Hold the call for the given duration before answering normally.
    Stall(Duration),
    /// Execute immediately, but hold the reply for the given duration.
    SlowReply(Duration),
}

#[derive(Debug, Clone)]
struct StoredRecord {
    doc: Value,
    version: u64,
    clock: VectorClock,
    updated_at: DateTime<Utc>,
}

impl StoredRecord {
    fn snapshot(&self) -> RecordVersion {
        RecordVersion::new(self.version, self.clock.clone(), self.updated_at, self.doc.clone())
    }
}

type Collection = BTreeMap<String, StoredRecord>;

/// In-memory backend adapter.
///
/// All data is lost on drop.
pub struct MemoryAdapter {
    name: String,
    capabilities: BTreeSet<String>,
    collections: RwLock<HashMap<String, Collection>>,
    connected: AtomicBool,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    faults: Mutex<VecDeque<FaultKind>>,
    dispatches: AtomicU64,
}

impl MemoryAdapter {
    /// Create a new, disconnected adapter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            collections: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            faults: Mutex::new(VecDeque::new()),
            dispatches: AtomicU64::new(0),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail with `kind`.
    pub fn inject_faults(&self, count: usize, kind: FaultKind) {
        let mut faults = self.faults.lock();
        for _ in 0..count {
            faults.push_back(kind);
        }
    }

    /// Fail every call with a recoverable error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `execute` calls received.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::SeqCst)
    }

    /// Insert a record directly, bypassing `execute`.
    pub fn seed(&self, collection: &str, doc: Value, clock: VectorClock, at: DateTime<Utc>) {
        let id = record_id(&doc).unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut collections = self.collections.write();
        let records = collections.entry(collection.to_string()).or_default();
        let version = records.get(&id).map(|r| r.version + 1).unwrap_or(1);
        records.insert(
            id,
            StoredRecord {
                doc,
                version,
                clock,
                updated_at: at,
            },
        );
    }

    /// Current document stored under `id`.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .read()
            .get(collection)
            .and_then(|records| records.get(id))
            .map(|r| r.doc.clone())
    }

    /// Current version of the record stored under `id`.
    pub fn record_version(&self, collection: &str, id: &str) -> Option<RecordVersion> {
        self.collections
            .read()
            .get(collection)
            .and_then(|records| records.get(id))
            .map(StoredRecord::snapshot)
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|r| r.len())
            .unwrap_or(0)
    }

    /// Returns how long to hold the reply after executing.
    async fn before_call(&self) -> Result<Option<Duration>> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Fatal(format!("adapter '{}' is not connected", self.name)));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::recoverable(format!(
                "provider '{}' is unavailable",
                self.name
            )));
        }

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(FaultKind::Recoverable) => Err(Error::recoverable(format!(
                "transient failure on '{}'",
                self.name
            ))),
            Some(FaultKind::Fatal) => Err(Error::Fatal(format!(
                "backend '{}' rejected the operation",
                self.name
            ))),
            Some(FaultKind::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(None)
            }
            Some(FaultKind::SlowReply(duration)) => Ok(Some(duration)),
            None => Ok(None),
        }
    }

    fn create(&self, op: &CrudOperation) -> Result<RawResult> {
        let mut doc = op.data.clone().unwrap_or_else(|| Value::Object(Map::new()));
        let id = match record_id(&doc) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                if let Value::Object(map) = &mut doc {
                    map.insert(PRIMARY_KEY_FIELD.to_string(), Value::String(id.clone()));
                }
                id
            }
        };

        let mut collections = self.collections.write();
        let records = collections.entry(op.collection.clone()).or_default();
        let previous = records.get(&id).map(StoredRecord::snapshot);
        if previous.is_some() && !op.options.upsert {
            return Err(Error::Fatal(format!(
                "duplicate key '{}' in '{}'",
                id, op.collection
            )));
        }

        let stored = next_record(previous.as_ref(), doc, op);
        let version = stored.snapshot();
        records.insert(id, stored);

        Ok(RawResult {
            data: version.data.clone(),
            affected: 1,
            version: Some(version),
            previous,
        })
    }

    fn read(&self, op: &CrudOperation) -> Result<RawResult> {
        let collections = self.collections.read();
        let mut matched: Vec<&StoredRecord> = collections
            .get(&op.collection)
            .map(|records| {
                records
                    .values()
                    .filter(|r| matches_filter(&r.doc, op.filter.as_ref()))
                    .collect()
            })
            .unwrap_or_default();

        if !op.options.sort.is_empty() {
            matched.sort_by(|a, b| compare_docs(&a.doc, &b.doc, &op.options.sort));
        }

        let skip = op.options.skip.unwrap_or(0) as usize;
        let limit = op.options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let page: Vec<&StoredRecord> = matched.into_iter().skip(skip).take(limit).collect();

        let version = match page.as_slice() {
            [single] => Some(single.snapshot()),
            _ => None,
        };
        let docs: Vec<Value> = page
            .iter()
            .map(|r| project(&r.doc, op.options.projection.as_deref()))
            .collect();

        Ok(RawResult {
            affected: docs.len() as u64,
            data: Value::Array(docs),
            version,
            previous: None,
        })
    }

    fn update(&self, op: &CrudOperation) -> Result<RawResult> {
        let patch = op.data.clone().unwrap_or_else(|| Value::Object(Map::new()));
        let mut collections = self.collections.write();
        let records = collections.entry(op.collection.clone()).or_default();

        let mut ids: Vec<String> = records
            .iter()
            .filter(|(_, r)| matches_filter(&r.doc, op.filter.as_ref()))
            .map(|(id, _)| id.clone())
            .collect();
        if !op.options.multi {
            ids.truncate(1);
        }

        if ids.is_empty() {
            if !op.options.upsert {
                return Ok(RawResult::new(Value::Array(Vec::new()), 0));
            }
            let mut doc = op.filter.clone().unwrap_or_else(|| Value::Object(Map::new()));
            apply_patch(&mut doc, &patch, false);
            let id = record_id(&doc).unwrap_or_else(|| Uuid::new_v4().to_string());
            if let Value::Object(map) = &mut doc {
                map.insert(PRIMARY_KEY_FIELD.to_string(), Value::String(id.clone()));
            }
            let stored = next_record(None, doc, op);
            let version = stored.snapshot();
            records.insert(id, stored);
            return Ok(RawResult {
                data: version.data.clone(),
                affected: 1,
                version: Some(version),
                previous: None,
            });
        }

        let mut updated = Vec::with_capacity(ids.len());
        let mut first: Option<(RecordVersion, RecordVersion)> = None;
        for id in &ids {
            let Some(current) = records.get(id) else {
                continue;
            };
            let previous = current.snapshot();
            let mut doc = current.doc.clone();
            apply_patch(&mut doc, &patch, op.options.replace);
            if let Value::Object(map) = &mut doc {
                map.insert(PRIMARY_KEY_FIELD.to_string(), Value::String(id.clone()));
            }
            let stored = next_record(Some(&previous), doc, op);
            let version = stored.snapshot();
            updated.push(version.data.clone());
            if first.is_none() {
                first = Some((previous, version));
            }
            records.insert(id.clone(), stored);
        }

        let (previous, version) = match first {
            Some((p, v)) => (Some(p), Some(v)),
            None => (None, None),
        };
        let affected = updated.len() as u64;
        let data = if op.options.multi {
            Value::Array(updated)
        } else {
            updated.into_iter().next().unwrap_or(Value::Null)
        };

        Ok(RawResult {
            data,
            affected,
            version,
            previous,
        })
    }

    fn delete(&self, op: &CrudOperation) -> Result<RawResult> {
        let mut collections = self.collections.write();
        let Some(records) = collections.get_mut(&op.collection) else {
            return Ok(RawResult::new(Value::Array(Vec::new()), 0));
        };

        let mut ids: Vec<String> = records
            .iter()
            .filter(|(_, r)| matches_filter(&r.doc, op.filter.as_ref()))
            .map(|(id, _)| id.clone())
            .collect();
        if !op.options.multi {
            ids.truncate(1);
        }

        let removed: Vec<RecordVersion> = ids
            .iter()
            .filter_map(|id| records.remove(id))
            .map(|r| r.snapshot())
            .collect();

        let previous = removed.first().cloned();
        let affected = removed.len() as u64;
        let docs: Vec<Value> = removed.into_iter().map(|v| v.data).collect();

        Ok(RawResult {
            data: Value::Array(docs),
            affected,
            version: None,
            previous,
        })
    }
}

#[async_trait]
impl BackendAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        if let ConnectionConfig::Memory { latency_ms } = config {
            if *latency_ms > 0 {
                self.latency_ms.store(*latency_ms, Ordering::SeqCst);
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn execute(&self, operation: &CrudOperation) -> Result<RawResult> {
        let hold = self.before_call().await?;

        let result = match operation.kind {
            OperationKind::Create => self.create(operation),
            OperationKind::Read => self.read(operation),
            OperationKind::Update => self.update(operation),
            OperationKind::Delete => self.delete(operation),
            OperationKind::Batch => Err(Error::Validation(
                "adapters execute batch items individually".to_string(),
            )),
        };
        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
        }
        result
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }
}

/// Build the record that replaces `previous` after a write by `op`.
///
/// A caller-supplied clock already accounts for the write; otherwise the
/// writer's own component is advanced.
fn next_record(previous: Option<&RecordVersion>, doc: Value, op: &CrudOperation) -> StoredRecord {
    let base = previous.map(|p| p.clock.clone()).unwrap_or_default();
    let clock = match &op.metadata.vector_clock {
        Some(clock) => base.merged(clock),
        None => {
            let mut clock = base;
            clock.increment(&op.metadata.caller_id);
            clock
        }
    };

    StoredRecord {
        doc,
        version: previous.map(|p| p.version + 1).unwrap_or(1),
        clock,
        updated_at: op.metadata.submitted_at,
    }
}

fn record_id(doc: &Value) -> Option<String> {
    match doc.get(PRIMARY_KEY_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn apply_patch(doc: &mut Value, patch: &Value, replace: bool) {
    if replace {
        *doc = patch.clone();
        return;
    }
    if let (Value::Object(target), Value::Object(fields)) = (doc, patch) {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn project(doc: &Value, projection: Option<&[String]>) -> Value {
    let (Some(fields), Value::Object(map)) = (projection, doc) else {
        return doc.clone();
    };
    let projected: Map<String, Value> = map
        .iter()
        .filter(|(k, _)| fields.iter().any(|f| f == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(projected)
}

fn compare_docs(a: &Value, b: &Value, sort: &[SortKey]) -> CmpOrdering {
    for key in sort {
        let ordering = compare_values(a.get(&key.field), b.get(&key.field));
        let ordering = if key.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != CmpOrdering::Equal {
            return ordering;
        }
    }
    CmpOrdering::Equal
}

/// Missing and null sort first, then booleans, numbers, strings.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    async fn connected(name: &str) -> MemoryAdapter {
        let adapter = MemoryAdapter::new(name);
        adapter.connect(&ConnectionConfig::default()).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let adapter = connected("mem").await;
        adapter
            .execute(&CrudOperation::create("users", json!({"id": "u1", "name": "Ada"})))
            .await
            .unwrap();

        let result = adapter
            .execute(&CrudOperation::read("users", json!({"id": "u1"})))
            .await
            .unwrap();

        assert_eq!(result.data, json!([{"id": "u1", "name": "Ada"}]));
        assert_eq!(result.version.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let adapter = connected("mem").await;
        let result = adapter
            .execute(&CrudOperation::create("users", json!({"name": "Ada"})))
            .await
            .unwrap();
        assert!(result.data.get("id").and_then(|v| v.as_str()).is_some());
        assert_eq!(adapter.count("users"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_fatal() {
        let adapter = connected("mem").await;
        let op = CrudOperation::create("users", json!({"id": "u1"}));
        adapter.execute(&op).await.unwrap();
        let err = adapter.execute(&op).await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[tokio::test]
    async fn test_update_reports_previous_version() {
        let adapter = connected("mem").await;
        adapter
            .execute(&CrudOperation::create("users", json!({"id": "u1", "n": 1})))
            .await
            .unwrap();

        let result = adapter
            .execute(&CrudOperation::update("users", json!({"id": "u1"}), json!({"n": 2})))
            .await
            .unwrap();

        assert_eq!(result.data, json!({"id": "u1", "n": 2}));
        assert_eq!(result.previous.unwrap().data, json!({"id": "u1", "n": 1}));
        assert_eq!(result.version.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_update_without_match_and_upsert() {
        let adapter = connected("mem").await;
        let mut op = CrudOperation::update("users", json!({"id": "u9"}), json!({"n": 1}));

        let result = adapter.execute(&op).await.unwrap();
        assert_eq!(result.affected, 0);

        op.options.upsert = true;
        let result = adapter.execute(&op).await.unwrap();
        assert_eq!(result.affected, 1);
        assert_eq!(adapter.document("users", "u9"), Some(json!({"id": "u9", "n": 1})));
    }

    #[tokio::test]
    async fn test_replace_update() {
        let adapter = connected("mem").await;
        adapter
            .execute(&CrudOperation::create("users", json!({"id": "u1", "a": 1, "b": 2})))
            .await
            .unwrap();

        let mut op = CrudOperation::update("users", json!({"id": "u1"}), json!({"c": 3}));
        op.options.replace = true;
        adapter.execute(&op).await.unwrap();

        assert_eq!(adapter.document("users", "u1"), Some(json!({"id": "u1", "c": 3})));
    }

    #[tokio::test]
    async fn test_delete_multi() {
        let adapter = connected("mem").await;
        for i in 0..3 {
            adapter
                .execute(&CrudOperation::create("items", json!({"id": i, "kind": "x"})))
                .await
                .unwrap();
        }

        let mut op = CrudOperation::delete("items", json!({"kind": "x"}));
        op.options.multi = true;
        let result = adapter.execute(&op).await.unwrap();

        assert_eq!(result.affected, 3);
        assert_eq!(adapter.count("items"), 0);
    }

    #[tokio::test]
    async fn test_sort_skip_limit_projection() {
        let adapter = connected("mem").await;
        for (id, score) in [("a", 3), ("b", 1), ("c", 2)] {
            adapter
                .execute(&CrudOperation::create(
                    "scores",
                    json!({"id": id, "score": score, "extra": true}),
                ))
                .await
                .unwrap();
        }

        let mut op = CrudOperation::read("scores", json!({}));
        op.options.sort = vec![SortKey {
            field: "score".to_string(),
            descending: true,
        }];
        op.options.skip = Some(1);
        op.options.limit = Some(1);
        op.options.projection = Some(vec!["id".to_string()]);

        let result = adapter.execute(&op).await.unwrap();
        assert_eq!(result.data, json!([{"id": "c"}]));
    }

    #[tokio::test]
    async fn test_clock_advances_for_writer() {
        let adapter = connected("mem").await;
        let op = CrudOperation::create("users", json!({"id": "u1"})).with_caller("svc");
        adapter.execute(&op).await.unwrap();

        let version = adapter.record_version("users", "u1").unwrap();
        assert_eq!(version.clock.get("svc"), 1);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let adapter = connected("mem").await;
        adapter.inject_faults(1, FaultKind::Recoverable);
        adapter.inject_faults(1, FaultKind::Fatal);

        let op = CrudOperation::read("users", json!({}));
        assert!(adapter.execute(&op).await.unwrap_err().is_recoverable());
        assert!(matches!(adapter.execute(&op).await.unwrap_err(), Error::Fatal(_)));
        assert!(adapter.execute(&op).await.is_ok());
        assert_eq!(adapter.dispatch_count(), 3);
    }

    #[tokio::test]
    async fn test_slow_reply_returns_earlier_state() {
        let adapter = Arc::new(connected("mem").await);
        adapter
            .execute(&CrudOperation::create("users", json!({"id": "u1", "n": 1})))
            .await
            .unwrap();
        adapter.inject_faults(1, FaultKind::SlowReply(Duration::from_millis(50)));

        let reader = adapter.clone();
        let read = tokio::spawn(async move {
            reader
                .execute(&CrudOperation::read("users", json!({"id": "u1"})))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        adapter
            .execute(&CrudOperation::update("users", json!({"id": "u1"}), json!({"n": 2})))
            .await
            .unwrap();

        let result = read.await.unwrap().unwrap();
        assert_eq!(result.data, json!([{"id": "u1", "n": 1}]));
        assert_eq!(adapter.document("users", "u1").unwrap()["n"], json!(2));
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let adapter = MemoryAdapter::new("mem");
        let err = adapter
            .execute(&CrudOperation::read("users", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let adapter = connected("mem").await;
        adapter.set_unavailable(true);
        let err = adapter
            .execute(&CrudOperation::read("users", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
