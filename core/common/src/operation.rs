//! The operation envelope: requests (`CrudOperation`) and responses (`CrudResult`).
//!
//! An operation is immutable once submitted and flows through the executor
//! pipeline as the unit of work. Exactly one result is produced per operation
//! (or per item of a batch).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::clock::VectorClock;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{ConflictId, OperationId, OptimisticId, ResourceKey};

/// Kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Read,
    Update,
    Delete,
    Batch,
}

impl OperationKind {
    /// Create, update and delete mutate backend state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            OperationKind::Create | OperationKind::Update | OperationKind::Delete
        )
    }

    /// Lowercase name used in logs and samples.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Batch => "batch",
        }
    }
}

/// Replica visibility guarantee at the time a write is reported successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    /// Replicate asynchronously; return after the primary write.
    #[default]
    Eventual,
    /// Await every replica before reporting success.
    Strong,
    /// Await replicas up to a configured timeout.
    Bounded,
    /// Asynchronous, each replicated write carries the originating clock.
    Causal,
}

/// One sort key of a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Execution options of an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationOptions {
    /// Create the record if an update matches nothing.
    pub upsert: bool,
    /// Apply an update/delete to every matching record.
    pub multi: bool,
    /// Replace the whole record instead of patching fields.
    pub replace: bool,
    /// Require a provider with transaction support.
    pub transactional: bool,
    pub sort: Vec<SortKey>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    /// Fields to return on reads.
    pub projection: Option<Vec<String>>,
    /// Per-provider-call timeout.
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Option<Duration>,
    /// Capability tags the executing provider must carry.
    pub required_capabilities: Vec<String>,
    /// Capability tags that raise a provider's selection score.
    pub preferred_capabilities: Vec<String>,
    /// Region the executing provider must serve.
    pub region: Option<String>,
    pub replication_factor: Option<usize>,
    pub consistency: Option<ConsistencyLevel>,
    /// Minimum successful items for a batch to count as successful.
    pub min_successes: Option<usize>,
    /// Time-to-live of the optimistic record for this write.
    #[serde(rename = "optimisticTtlMs", with = "duration_ms")]
    pub optimistic_ttl: Option<Duration>,
}

/// Caller-supplied metadata of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationMetadata {
    pub caller_id: String,
    pub session_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Version number the caller based this write on.
    pub version: Option<u64>,
    pub vector_clock: Option<VectorClock>,
    /// Apply the write locally before remote confirmation.
    pub optimistic: bool,
}

impl Default for OperationMetadata {
    fn default() -> Self {
        Self {
            caller_id: "anonymous".to_string(),
            session_id: None,
            submitted_at: Utc::now(),
            version: None,
            vector_clock: None,
            optimistic: false,
        }
    }
}

/// A single unit of work submitted to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudOperation {
    #[serde(default = "OperationId::generate")]
    pub id: OperationId,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Provider hint; restricts execution to the named provider.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub options: OperationOptions,
    #[serde(default)]
    pub metadata: OperationMetadata,
    /// Items of a `batch` operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch: Vec<CrudOperation>,
}

impl CrudOperation {
    /// Create an operation of the given kind against a collection.
    pub fn new(kind: OperationKind, collection: impl Into<String>) -> Self {
        Self {
            id: OperationId::generate(),
            kind,
            provider: None,
            collection: collection.into(),
            data: None,
            filter: None,
            options: OperationOptions::default(),
            metadata: OperationMetadata::default(),
            batch: Vec::new(),
        }
    }

    pub fn create(collection: impl Into<String>, data: Value) -> Self {
        Self::new(OperationKind::Create, collection).with_data(data)
    }

    pub fn read(collection: impl Into<String>, filter: Value) -> Self {
        Self::new(OperationKind::Read, collection).with_filter(filter)
    }

    pub fn update(collection: impl Into<String>, filter: Value, data: Value) -> Self {
        Self::new(OperationKind::Update, collection)
            .with_filter(filter)
            .with_data(data)
    }

    pub fn delete(collection: impl Into<String>, filter: Value) -> Self {
        Self::new(OperationKind::Delete, collection).with_filter(filter)
    }

    /// Wrap several operations into one batch envelope.
    pub fn batch(items: Vec<CrudOperation>) -> Self {
        let mut op = Self::new(OperationKind::Batch, "");
        op.batch = items;
        op
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_options(mut self, options: OperationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.metadata.caller_id = caller_id.into();
        self
    }

    pub fn with_clock(mut self, clock: VectorClock) -> Self {
        self.metadata.vector_clock = Some(clock);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.metadata.version = Some(version);
        self
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.metadata.optimistic = optimistic;
        self
    }

    /// Resource this operation targets.
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.collection, self.filter.as_ref(), self.data.as_ref())
    }

    /// Capability tags a provider must carry to execute this operation.
    pub fn required_capabilities(&self) -> Vec<String> {
        let mut required = self.options.required_capabilities.clone();
        if self.options.transactional && !required.iter().any(|c| c == "transactions") {
            required.push("transactions".to_string());
        }
        required
    }

    /// Check shape and required fields.
    ///
    /// # Errors
    /// - `Error::Validation` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.kind == OperationKind::Batch {
            if self.batch.is_empty() {
                return Err(invalid(&self.id, "batch must contain at least one item"));
            }
            if let Some(min) = self.options.min_successes {
                if min > self.batch.len() {
                    return Err(invalid(
                        &self.id,
                        "minSuccesses exceeds the number of batch items",
                    ));
                }
            }
            for item in &self.batch {
                if item.kind == OperationKind::Batch {
                    return Err(invalid(&self.id, "batches cannot be nested"));
                }
                item.validate()?;
            }
            return Ok(());
        }

        if !self.batch.is_empty() {
            return Err(invalid(&self.id, "only batch operations may carry items"));
        }
        validate_collection_name(&self.id, &self.collection)?;

        if let Some(filter) = &self.filter {
            if !filter.is_object() {
                return Err(invalid(&self.id, "filter must be an object"));
            }
        }
        if let Some(data) = &self.data {
            if !data.is_object() {
                return Err(invalid(&self.id, "data must be an object"));
            }
        }

        match self.kind {
            OperationKind::Create if self.data.is_none() => {
                return Err(invalid(&self.id, "create requires data"));
            }
            OperationKind::Update if self.data.is_none() => {
                return Err(invalid(&self.id, "update requires data"));
            }
            OperationKind::Update | OperationKind::Delete if self.filter.is_none() => {
                return Err(invalid(
                    &self.id,
                    &format!("{} requires a filter", self.kind.as_str()),
                ));
            }
            OperationKind::Read if self.metadata.optimistic => {
                return Err(invalid(&self.id, "optimistic applies to writes only"));
            }
            _ => {}
        }

        if self.options.timeout == Some(Duration::ZERO) {
            return Err(invalid(&self.id, "timeout must be positive"));
        }
        if self.options.replication_factor == Some(0) {
            return Err(invalid(&self.id, "replicationFactor must be at least 1"));
        }
        if let Some(projection) = &self.options.projection {
            if projection.iter().any(|f| f.is_empty()) {
                return Err(invalid(&self.id, "projection fields cannot be empty"));
            }
        }
        if self.options.sort.iter().any(|s| s.field.is_empty()) {
            return Err(invalid(&self.id, "sort fields cannot be empty"));
        }

        Ok(())
    }
}

fn invalid(id: &OperationId, message: &str) -> Error {
    Error::Validation(format!("operation {}: {}", id, message))
}

fn validate_collection_name(id: &OperationId, collection: &str) -> Result<()> {
    if collection.is_empty() {
        return Err(invalid(id, "collection is required"));
    }
    let valid = collection
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        return Err(invalid(
            id,
            "collection may only contain letters, digits, '_', '-' and '.'",
        ));
    }
    Ok(())
}

/// Replication outcome reported with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStatus {
    /// Every replica acknowledged.
    Completed,
    /// Replication still running (eventual, causal, or bounded timeout).
    Pending,
    /// Some replicas failed and were queued for retry.
    Partial,
    /// Every replica failed and was queued for retry.
    Failed,
}

/// Structured error in a result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    #[serde(rename = "retryAfterMs", with = "duration_ms", default)]
    pub retry_after: Option<Duration>,
}

impl ResultError {
    /// Build the envelope error for a failed operation.
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            retry_after: err.retry_after(),
        }
    }
}

/// Execution metadata of a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub provider: Option<String>,
    pub execution_time_ms: u64,
    pub cache_hit: bool,
    pub conflict_detected: bool,
    /// A manual conflict is waiting for an external decision.
    pub conflict_unresolved: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conflict_id: Option<ConflictId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub replication_status: Option<ReplicationStatus>,
    pub consistency_level: ConsistencyLevel,
    /// Result was produced from optimistic local state.
    pub provisional: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub optimistic_id: Option<OptimisticId>,
    /// Provider calls made, replicas included.
    pub dispatches: u32,
    /// Attempts against the executing provider.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub shard: Option<u32>,
}

/// Response envelope; produced exactly once per operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrudResult {
    pub operation_id: OperationId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ResultError>,
    pub metadata: ResultMetadata,
}

impl CrudResult {
    pub fn success(operation_id: OperationId, data: Option<Value>, metadata: ResultMetadata) -> Self {
        Self {
            operation_id,
            success: true,
            data,
            error: None,
            metadata,
        }
    }

    pub fn failure(operation_id: OperationId, err: &Error, metadata: ResultMetadata) -> Self {
        Self {
            operation_id,
            success: false,
            data: None,
            error: Some(ResultError::from_error(err)),
            metadata,
        }
    }

    /// Error code, if the operation failed.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Serde helper storing `Option<Duration>` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
