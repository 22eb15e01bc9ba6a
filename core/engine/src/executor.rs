//! Operation executor that runs every operation through the pipeline.

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use polyweave_common::{
    ConflictId, ConsistencyLevel, CrudOperation, CrudResult, Error, OperationKind, OptimisticId,
    RecordVersion, ReplicationStatus, ResultError, ResultMetadata, Result, PRIMARY_KEY_FIELD,
};
use polyweave_storage::{AdapterFactories, InitReport, ProviderRegistry, RawResult};

use crate::cache::{cache_key, collection_prefix, CacheConfig, ResultCache};
use crate::config::OrchestratorConfig;
use crate::conflict::{
    close, ConflictDetector, ConflictQueue, ConflictRecord, ConflictResolver, ConflictStrategy,
    Decision, MergeRegistry, Resolution,
};
use crate::events::{EngineEvent, EventBus};
use crate::locks::KeyLocks;
use crate::metrics::{MetricsSnapshot, PerformanceMonitor, PerformanceSample};
use crate::optimistic::{provisional_data, OptimisticTracker};
use crate::replication::ReplicationCoordinator;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::BackgroundTasks;
use crate::selector::{ProviderSelector, ReadPreference, Selection};
use crate::shard::ShardRouter;

/// Caller id stamped on corrective writes issued by conflict resolution.
pub const CONFLICT_RESOLVER: &str = "conflict-resolver";

/// Per-item results of a batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<CrudResult>,
    pub succeeded: usize,
    pub failed: usize,
    /// At least the declared minimum of items succeeded.
    pub success: bool,
}

/// Settings resolved from configuration at build time.
#[derive(Debug, Clone)]
struct Settings {
    default_timeout: Duration,
    replication_factor: usize,
    consistency: ConsistencyLevel,
    read_preference: ReadPreference,
    caching_enabled: bool,
    conflict_strategy: ConflictStrategy,
    vector_clocks: bool,
    optimistic_ttl: Duration,
    sweep_interval: Duration,
    conflict_queue_interval: Duration,
    aggregator_interval: Duration,
    replication_retry_interval: Duration,
}

impl Settings {
    fn from_config(config: &OrchestratorConfig) -> Self {
        let background = &config.background;
        Self {
            default_timeout: config.executor.default_timeout(),
            replication_factor: config.replication.factor,
            consistency: config.replication.consistency,
            read_preference: config.replication.read_preference,
            caching_enabled: config.caching.enabled,
            conflict_strategy: config.conflict.strategy.clone(),
            vector_clocks: config.conflict.vector_clocks,
            optimistic_ttl: config.optimistic.ttl(),
            sweep_interval: Duration::from_millis(background.sweep_interval_ms),
            conflict_queue_interval: Duration::from_millis(background.conflict_queue_interval_ms),
            aggregator_interval: Duration::from_millis(background.aggregator_interval_ms),
            replication_retry_interval: Duration::from_millis(
                background.replication_retry_interval_ms,
            ),
        }
    }
}

struct Inner {
    registry: Arc<ProviderRegistry>,
    selector: ProviderSelector,
    cache: Arc<ResultCache>,
    tracker: OptimisticTracker,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    conflicts: ConflictQueue,
    replication: ReplicationCoordinator,
    monitor: PerformanceMonitor,
    shards: Option<ShardRouter>,
    locks: KeyLocks,
    /// In-flight reads keyed by cache key.
    flights: DashMap<String, Arc<OnceCell<CrudResult>>>,
    events: EventBus,
    retry: RetryConfig,
    settings: Settings,
}

/// Entry point for CRUD operations.
///
/// Cheap to clone; clones share every component. Unrelated operations run
/// concurrently, operations on the same resource key are serialized around
/// conflict resolution and optimistic confirmation.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// Build an executor over an existing registry.
    ///
    /// # Errors
    /// - `Error::Config` if the configured merge function is unknown or the
    ///   sharding parameters are invalid
    pub fn new(registry: Arc<ProviderRegistry>, config: &OrchestratorConfig) -> Result<Self> {
        Self::with_merge_registry(registry, config, MergeRegistry::new())
    }

    /// Build an executor with caller-supplied merge functions.
    pub fn with_merge_registry(
        registry: Arc<ProviderRegistry>,
        config: &OrchestratorConfig,
        merges: MergeRegistry,
    ) -> Result<Self> {
        let resolver = ConflictResolver::new(merges);
        resolver.check(&config.conflict.strategy)?;
        let shards = config.sharding.clone().map(ShardRouter::new).transpose()?;

        let settings = Settings::from_config(config);
        let events = EventBus::default();
        let cache = Arc::new(ResultCache::new(CacheConfig {
            max_entries: config.caching.max_entries,
            default_ttl: config.caching.ttl(),
            policy: config.caching.eviction,
        }));
        let tracker =
            OptimisticTracker::new(cache.clone(), events.clone(), config.optimistic.retention());
        let replication = ReplicationCoordinator::new(
            registry.clone(),
            events.clone(),
            config.replication.retry_config(),
            config.replication.retry_attempts,
            config.replication.bounded_timeout(),
            settings.default_timeout,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                selector: ProviderSelector::new(
                    config.local_region.clone(),
                    config.default_provider.clone(),
                ),
                cache,
                tracker,
                detector: ConflictDetector::new(config.conflict.vector_clocks),
                resolver,
                conflicts: ConflictQueue::new(),
                replication,
                monitor: PerformanceMonitor::new(
                    Duration::from_millis(config.metrics.window_ms),
                    config.metrics.max_samples,
                ),
                shards,
                locks: KeyLocks::new(),
                flights: DashMap::new(),
                events,
                retry: config.executor.retry_config(),
                settings,
                registry,
            }),
        })
    }

    /// Register every configured provider through `factories`, connect them
    /// and build the executor.
    pub async fn from_config(
        config: &OrchestratorConfig,
        factories: &AdapterFactories,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ProviderRegistry::new());
        for provider in &config.providers {
            let descriptor = provider.descriptor();
            let adapter = factories.create(&descriptor, &provider.connection)?;
            registry.register(descriptor, adapter, provider.connection.clone())?;
        }

        let executor = Self::new(registry, config)?;
        executor.initialize().await;
        Ok(executor)
    }

    /// Connect every registered provider and publish the outcome.
    pub async fn initialize(&self) -> InitReport {
        let report = self.inner.registry.initialize_all().await;
        for provider in &report.initialized {
            self.inner.events.publish(EngineEvent::ProviderConnected {
                provider: provider.clone(),
            });
        }
        for (provider, error) in &report.failed {
            self.inner.events.publish(EngineEvent::ProviderFailed {
                provider: provider.clone(),
                error: error.clone(),
            });
        }
        info!(
            "Providers initialized: {} connected, {} failed",
            report.initialized.len(),
            report.failed.len()
        );
        report
    }

    /// Execute one operation.
    pub async fn execute(&self, operation: CrudOperation) -> CrudResult {
        self.execute_cancellable(operation, CancellationToken::new())
            .await
    }

    /// Execute one operation, aborting in-flight work when `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        operation: CrudOperation,
        cancel: CancellationToken,
    ) -> CrudResult {
        if operation.kind != OperationKind::Batch {
            return self.execute_single(operation, cancel).await;
        }

        let started = Instant::now();
        if let Err(e) = operation.validate() {
            let result = CrudResult::failure(operation.id.clone(), &e, self.base_metadata(&operation));
            return self.finish(OperationKind::Batch, result, started);
        }

        let min_successes = operation.options.min_successes;
        let outcome = self
            .run_batch(operation.batch, min_successes, &cancel)
            .await;
        let result = batch_envelope(operation.id, outcome, self.inner.settings.consistency);
        self.finish(OperationKind::Batch, result, started)
    }

    /// Execute independent operations concurrently; every item yields its own
    /// result regardless of the others.
    pub async fn execute_batch(&self, operations: Vec<CrudOperation>) -> BatchOutcome {
        self.run_batch(operations, None, &CancellationToken::new())
            .await
    }

    async fn run_batch(
        &self,
        operations: Vec<CrudOperation>,
        min_successes: Option<usize>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let total = operations.len();
        let results = join_all(
            operations
                .into_iter()
                .map(|op| self.execute_single(op, cancel.clone())),
        )
        .await;

        let succeeded = results.iter().filter(|r| r.success).count();
        let required = min_successes.unwrap_or(total);
        debug!("Batch finished: {}/{} succeeded", succeeded, total);

        BatchOutcome {
            failed: total - succeeded,
            success: succeeded >= required,
            succeeded,
            results,
        }
    }

    async fn execute_single(&self, operation: CrudOperation, cancel: CancellationToken) -> CrudResult {
        let started = Instant::now();
        let kind = operation.kind;

        if let Err(e) = operation.validate() {
            debug!(operation = %operation.id, "Rejected operation: {}", e);
            let result = CrudResult::failure(operation.id.clone(), &e, self.base_metadata(&operation));
            return self.finish(kind, result, started);
        }
        if kind == OperationKind::Batch {
            let err = Error::Validation("batches cannot be nested".to_string());
            let result = CrudResult::failure(operation.id.clone(), &err, self.base_metadata(&operation));
            return self.finish(kind, result, started);
        }

        if kind.is_write() && operation.metadata.optimistic {
            return self.execute_optimistic(operation, cancel, started).await;
        }

        let result = if kind.is_write() {
            self.execute_write(&operation, &cancel, None).await
        } else {
            self.execute_read(&operation, &cancel).await
        };
        self.finish(kind, result, started)
    }

    /// Stamp timing, record the sample and publish the final result.
    ///
    /// Recoverable failures without a provider hint get the backoff that
    /// would follow the attempts already made.
    fn finish(&self, kind: OperationKind, mut result: CrudResult, started: Instant) -> CrudResult {
        let elapsed = started.elapsed();
        result.metadata.execution_time_ms = elapsed.as_millis() as u64;
        if let Some(error) = result.error.as_mut() {
            if error.recoverable && error.retry_after.is_none() {
                error.retry_after = Some(self.inner.retry.backoff(result.metadata.attempts));
            }
        }
        self.inner
            .monitor
            .record(PerformanceSample::from_result(kind, &result, elapsed));
        self.inner.events.publish(EngineEvent::OperationCompleted {
            result: result.clone(),
        });
        result
    }

    fn base_metadata(&self, operation: &CrudOperation) -> ResultMetadata {
        ResultMetadata {
            consistency_level: operation
                .options
                .consistency
                .unwrap_or(self.inner.settings.consistency),
            ..ResultMetadata::default()
        }
    }

    fn plan(&self, operation: &CrudOperation) -> Result<Selection> {
        if let Some(hint) = &operation.provider {
            self.inner.registry.get(hint)?;
        }
        let candidates = self.inner.registry.list_available();
        let factor = operation
            .options
            .replication_factor
            .unwrap_or(self.inner.settings.replication_factor);
        self.inner.selector.plan(
            operation,
            &candidates,
            factor,
            self.inner.settings.read_preference,
        )
    }

    fn route(&self, operation: &CrudOperation) -> Result<Option<u32>> {
        match &self.inner.shards {
            Some(router) => router.route(operation),
            None => Ok(None),
        }
    }

    async fn execute_read(&self, operation: &CrudOperation, cancel: &CancellationToken) -> CrudResult {
        if !self.inner.settings.caching_enabled {
            return self.fetch_read(operation, cancel, None).await;
        }

        let key = cache_key(operation);
        if let Some(value) = self.inner.cache.get(&key) {
            debug!(key = %key, "Cache hit");
            let mut metadata = self.base_metadata(operation);
            metadata.cache_hit = true;
            return CrudResult::success(operation.id.clone(), Some(value), metadata);
        }

        let flight = self
            .inner
            .flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let shared = flight
            .get_or_init(|| async {
                // An earlier flight may have filled the cache after our miss.
                if let Some(value) = self.inner.cache.get(&key) {
                    let mut metadata = self.base_metadata(operation);
                    metadata.cache_hit = true;
                    return CrudResult::success(operation.id.clone(), Some(value), metadata);
                }
                self.fetch_read(operation, cancel, Some(&key)).await
            })
            .await
            .clone();
        self.inner
            .flights
            .remove_if(&key, |_, cell| Arc::ptr_eq(cell, &flight));

        if shared.operation_id == operation.id {
            return shared;
        }

        // Joined another caller's fetch.
        CrudResult {
            operation_id: operation.id.clone(),
            metadata: ResultMetadata {
                dispatches: 0,
                attempts: 0,
                ..shared.metadata
            },
            ..shared
        }
    }

    async fn fetch_read(
        &self,
        operation: &CrudOperation,
        cancel: &CancellationToken,
        key: Option<&str>,
    ) -> CrudResult {
        let mut metadata = self.base_metadata(operation);
        let prefix = collection_prefix(&operation.collection);
        let generation = self.inner.cache.generation(&prefix);
        let selection = match self.plan(operation) {
            Ok(selection) => selection,
            Err(e) => return CrudResult::failure(operation.id.clone(), &e, metadata),
        };
        metadata.shard = match self.route(operation) {
            Ok(shard) => shard,
            Err(e) => return CrudResult::failure(operation.id.clone(), &e, metadata),
        };

        let mut last_error = None;
        for provider in selection.ranked() {
            metadata.provider = Some(provider.name.clone());
            match self
                .call_with_retry(&provider.name, operation, cancel, &mut metadata)
                .await
            {
                Ok(raw) => {
                    // A write that landed during the fetch invalidated the
                    // collection; its data must not be cached.
                    if let Some(key) = key {
                        let evicted = self.inner.cache.put_if_current(
                            key,
                            raw.data.clone(),
                            operation.filter.clone(),
                            None,
                            &prefix,
                            generation,
                        );
                        for key in evicted.into_iter().flatten() {
                            self.inner.events.publish(EngineEvent::CacheEvicted { key });
                        }
                    }
                    return CrudResult::success(operation.id.clone(), Some(raw.data), metadata);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(
                        operation = %operation.id,
                        provider = %provider.name,
                        "Read failed, trying next provider: {}",
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return CrudResult::failure(operation.id.clone(), &e, metadata),
            }
        }

        let err = last_error.unwrap_or_else(|| {
            Error::NoSuitableProvider(format!("no provider served read {}", operation.id))
        });
        CrudResult::failure(operation.id.clone(), &err, metadata)
    }

    /// Call one provider with the operation's timeout, retrying recoverable
    /// failures. Attempts are added to `metadata`.
    async fn call_with_retry(
        &self,
        provider: &str,
        operation: &CrudOperation,
        cancel: &CancellationToken,
        metadata: &mut ResultMetadata,
    ) -> Result<RawResult> {
        let adapter = self.inner.registry.adapter(provider)?;
        let timeout = operation
            .options
            .timeout
            .unwrap_or(self.inner.settings.default_timeout);
        let attempts = AtomicU32::new(0);
        let retry = RetryExecutor::new(self.inner.retry.clone()).with_attempt_timeout(timeout);

        let call = retry.run(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            adapter.execute(operation)
        });

        // Attempts already dispatched still count when cancellation wins.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!(
                "operation {} cancelled",
                operation.id
            ))),
            attempted = call => attempted.result,
        };

        let made = attempts.load(Ordering::SeqCst);
        metadata.attempts += made;
        metadata.dispatches += made;
        result
    }

    async fn execute_write(
        &self,
        operation: &CrudOperation,
        cancel: &CancellationToken,
        optimistic: Option<&OptimisticId>,
    ) -> CrudResult {
        let mut metadata = self.base_metadata(operation);
        metadata.optimistic_id = optimistic.cloned();

        let selection = match self.plan(operation) {
            Ok(selection) => selection,
            Err(e) => return self.fail_write(operation, optimistic, &e, metadata).await,
        };
        metadata.shard = match self.route(operation) {
            Ok(shard) => shard,
            Err(e) => return self.fail_write(operation, optimistic, &e, metadata).await,
        };
        let primary = selection.primary.name.clone();
        metadata.provider = Some(primary.clone());

        let raw = match self
            .call_with_retry(&primary, operation, cancel, &mut metadata)
            .await
        {
            Ok(raw) => raw,
            Err(e) => return self.fail_write(operation, optimistic, &e, metadata).await,
        };

        let resource = operation.resource_key();
        let guard = self.inner.locks.lock(resource.to_string()).await;
        let prefix = collection_prefix(&operation.collection);

        if cancel.is_cancelled() {
            if let Some(id) = optimistic {
                self.rollback_optimistic(id, "cancelled");
            }
            self.inner.cache.invalidate_by_prefix(&prefix);
            drop(guard);
            let err = Error::Cancelled(format!(
                "operation {} cancelled after the primary write",
                operation.id
            ));
            return CrudResult::failure(operation.id.clone(), &err, metadata);
        }

        let corrective = self
            .reconcile(operation, &primary, &raw, cancel, &mut metadata)
            .await;
        self.inner.cache.invalidate_by_prefix(&prefix);

        if let Some(id) = optimistic {
            if let Err(e) = self.inner.tracker.confirm(id) {
                warn!(id = %id, "Optimistic update not confirmed: {}", e);
            }
        }
        drop(guard);

        let (data, source, clock) = match &corrective {
            Some((op, applied)) => (
                applied.data.clone(),
                op,
                applied.version.as_ref().map(|v| v.clock.clone()),
            ),
            None => (
                raw.data.clone(),
                operation,
                raw.version.as_ref().map(|v| v.clock.clone()),
            ),
        };

        let factor = operation
            .options
            .replication_factor
            .unwrap_or(self.inner.settings.replication_factor);
        let wanted = factor.saturating_sub(1);
        if wanted > 0 {
            let consistency = metadata.consistency_level;
            let replica =
                ReplicationCoordinator::replica_operation(source, clock.as_ref(), consistency);
            match self
                .inner
                .replication
                .replicate(&replica, &selection.replicas, wanted, consistency, cancel)
                .await
            {
                Ok(outcome) => {
                    metadata.dispatches += outcome.dispatches;
                    metadata.replication_status = Some(outcome.status);
                }
                Err(e) => {
                    warn!(operation = %operation.id, "Replication skipped: {}", e);
                    metadata.replication_status = Some(ReplicationStatus::Failed);
                }
            }
        }

        CrudResult::success(operation.id.clone(), Some(data), metadata)
    }

    async fn fail_write(
        &self,
        operation: &CrudOperation,
        optimistic: Option<&OptimisticId>,
        err: &Error,
        metadata: ResultMetadata,
    ) -> CrudResult {
        if let Some(id) = optimistic {
            let _guard = self.inner.locks.lock(operation.resource_key().to_string()).await;
            self.rollback_optimistic(id, err.to_string());
        }
        CrudResult::failure(operation.id.clone(), err, metadata)
    }

    fn rollback_optimistic(&self, id: &OptimisticId, reason: impl Into<String>) {
        match self.inner.tracker.rollback(id, reason) {
            Ok(()) => {}
            Err(Error::InvalidState(message)) => debug!(id = %id, "{}", message),
            Err(e) => error!(id = %id, "Optimistic rollback failed: {}", e),
        }
    }

    /// Detect and resolve a conflict between this write and the version it
    /// replaced. Returns the corrective write applied to the primary, if any.
    async fn reconcile(
        &self,
        operation: &CrudOperation,
        primary: &str,
        raw: &RawResult,
        cancel: &CancellationToken,
        metadata: &mut ResultMetadata,
    ) -> Option<(CrudOperation, RawResult)> {
        let remote = raw.previous.as_ref()?;
        let local = self.local_version(operation)?;
        let conflict = self.inner.detector.detect(
            &operation.id,
            &operation.resource_key(),
            &local,
            remote,
        )?;

        info!(
            conflict = %conflict.id,
            resource = %conflict.resource,
            "Conflict detected"
        );
        metadata.conflict_detected = true;
        metadata.conflict_id = Some(conflict.id.clone());
        self.inner.events.publish(EngineEvent::ConflictDetected {
            conflict_id: conflict.id.clone(),
            resource: conflict.resource.clone(),
        });

        let resolved = match self
            .inner
            .resolver
            .resolve(&conflict, &self.inner.settings.conflict_strategy)
        {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(conflict = %conflict.id, "Conflict resolution failed: {}", e);
                metadata.conflict_unresolved = true;
                self.inner.conflicts.push(conflict, primary);
                return None;
            }
        };

        let data = match (resolved.resolution, resolved.data) {
            (Resolution::Manual, _) | (_, None) => {
                metadata.conflict_unresolved = true;
                self.inner.conflicts.push(conflict, primary);
                return None;
            }
            (Resolution::Local, Some(_)) => {
                self.close_conflict(conflict, Resolution::Local, None, CONFLICT_RESOLVER);
                return None;
            }
            (_, Some(data)) => data,
        };

        let corrective = corrective_operation(&conflict, data.clone(), operation.options.timeout);
        match self
            .call_with_retry(primary, &corrective, cancel, metadata)
            .await
        {
            Ok(applied) => {
                let merged = (resolved.resolution == Resolution::Merged).then_some(data);
                self.close_conflict(conflict, resolved.resolution, merged, CONFLICT_RESOLVER);
                Some((corrective, applied))
            }
            Err(e) => {
                warn!(conflict = %conflict.id, "Corrective write failed, queued: {}", e);
                metadata.conflict_unresolved = true;
                let decision = match resolved.resolution {
                    Resolution::Merged => Decision::Merged(data),
                    _ => Decision::Remote,
                };
                let id = conflict.id.clone();
                self.inner.conflicts.push(conflict, primary);
                if let Err(e) = self.inner.conflicts.decide(&id, decision, CONFLICT_RESOLVER) {
                    error!(conflict = %id, "Could not queue conflict decision: {}", e);
                }
                None
            }
        }
    }

    /// Version this write was based on; `None` for blind writes.
    fn local_version(&self, operation: &CrudOperation) -> Option<RecordVersion> {
        let metadata = &operation.metadata;
        let clock = metadata
            .vector_clock
            .clone()
            .filter(|_| self.inner.settings.vector_clocks);
        if clock.is_none() && metadata.version.is_none() {
            return None;
        }

        Some(RecordVersion::new(
            metadata.version.unwrap_or(0),
            clock.unwrap_or_default(),
            metadata.submitted_at,
            operation.data.clone().unwrap_or(Value::Null),
        ))
    }

    fn close_conflict(
        &self,
        conflict: ConflictRecord,
        resolution: Resolution,
        merged: Option<Value>,
        resolver: &str,
    ) {
        let closed = close(conflict, resolution, merged, resolver);
        info!(conflict = %closed.id, resolution = ?resolution, "Conflict resolved");
        self.inner.events.publish(EngineEvent::ConflictResolved {
            conflict_id: closed.id.clone(),
            resolution,
        });
        self.inner.conflicts.record_closed(closed);
    }

    async fn execute_optimistic(
        &self,
        operation: CrudOperation,
        cancel: CancellationToken,
        started: Instant,
    ) -> CrudResult {
        let kind = operation.kind;
        let mut metadata = self.base_metadata(&operation);

        // Nothing is applied locally for writes no provider can take.
        let selection = match self.plan(&operation) {
            Ok(selection) => selection,
            Err(e) => {
                let result = CrudResult::failure(operation.id.clone(), &e, metadata);
                return self.finish(kind, result, started);
            }
        };

        let id = {
            let _guard = self.inner.locks.lock(operation.resource_key().to_string()).await;
            let ttl = operation
                .options
                .optimistic_ttl
                .unwrap_or(self.inner.settings.optimistic_ttl);
            let id = self.inner.tracker.apply(&operation, ttl);
            if let Err(e) = self.inner.tracker.mark_applied(&id) {
                warn!(id = %id, "Optimistic projection failed: {}", e);
            }
            id
        };

        metadata.provider = Some(selection.primary.name.clone());
        metadata.provisional = true;
        metadata.optimistic_id = Some(id.clone());
        metadata.execution_time_ms = started.elapsed().as_millis() as u64;
        let provisional =
            CrudResult::success(operation.id.clone(), Some(provisional_data(&operation)), metadata);

        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor
                .execute_write(&operation, &cancel, Some(&id))
                .await;
            executor.finish(kind, result, started);
        });

        provisional
    }

    /// Apply decided manual conflicts to their providers. Returns the number
    /// closed.
    pub async fn process_conflict_queue(&self) -> usize {
        let mut closed = 0;
        for queued in self.inner.conflicts.decided() {
            let Some((decision, resolver)) = queued.decision else {
                continue;
            };
            let record = queued.record;

            let (resolution, data) = match decision {
                Decision::Local => (Resolution::Local, None),
                Decision::Remote => (Resolution::Remote, Some(record.remote.data.clone())),
                Decision::Merged(value) => (Resolution::Merged, Some(value)),
            };

            if let Some(data) = &data {
                let corrective = corrective_operation(&record, data.clone(), None);
                let mut metadata = ResultMetadata::default();
                if let Err(e) = self
                    .call_with_retry(
                        &queued.provider,
                        &corrective,
                        &CancellationToken::new(),
                        &mut metadata,
                    )
                    .await
                {
                    warn!(conflict = %record.id, "Applying conflict decision failed: {}", e);
                    continue;
                }
                self.inner
                    .cache
                    .invalidate_by_prefix(&collection_prefix(record.resource.collection()));
            }

            let merged = if resolution == Resolution::Merged { data } else { None };
            self.close_conflict(record, resolution, merged, &resolver);
            closed += 1;
        }
        closed
    }

    /// Record an external decision on a manual conflict.
    pub fn decide_conflict(
        &self,
        id: &ConflictId,
        decision: Decision,
        resolver: impl Into<String>,
    ) -> Result<()> {
        self.inner.conflicts.decide(id, decision, resolver)
    }

    /// Start the optimistic sweep, conflict-queue processor, performance
    /// aggregator and replication retry.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let settings = &self.inner.settings;
        let mut tasks = BackgroundTasks::new();

        let executor = self.clone();
        tasks.spawn_periodic("optimistic-sweep", settings.sweep_interval, move || {
            let executor = executor.clone();
            async move {
                executor.inner.tracker.expire_stale(Instant::now());
            }
        });

        let executor = self.clone();
        tasks.spawn_periodic("conflict-queue", settings.conflict_queue_interval, move || {
            let executor = executor.clone();
            async move {
                let closed = executor.process_conflict_queue().await;
                if closed > 0 {
                    info!("Closed {} queued conflicts", closed);
                }
            }
        });

        let executor = self.clone();
        tasks.spawn_periodic("performance-aggregator", settings.aggregator_interval, move || {
            let executor = executor.clone();
            async move {
                executor.inner.monitor.aggregate();
            }
        });

        let executor = self.clone();
        tasks.spawn_periodic(
            "replication-retry",
            settings.replication_retry_interval,
            move || {
                let executor = executor.clone();
                async move {
                    executor.inner.replication.retry_pending().await;
                }
            },
        );

        tasks
    }

    /// Fresh metrics over the sampling window.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.monitor.aggregate()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    pub fn optimistic(&self) -> &OptimisticTracker {
        &self.inner.tracker
    }

    pub fn conflicts(&self) -> &ConflictQueue {
        &self.inner.conflicts
    }

    pub fn replication(&self) -> &ReplicationCoordinator {
        &self.inner.replication
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.inner.monitor
    }

    /// Shut down background work and disconnect every provider.
    pub async fn shutdown(&self, tasks: Option<BackgroundTasks>) {
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }
        self.inner.registry.shutdown().await;
    }
}

/// Write that makes the primary hold the winning data of a conflict.
fn corrective_operation(
    conflict: &ConflictRecord,
    data: Value,
    timeout: Option<Duration>,
) -> CrudOperation {
    let id = conflict
        .remote
        .data
        .get(PRIMARY_KEY_FIELD)
        .or_else(|| conflict.local.data.get(PRIMARY_KEY_FIELD))
        .cloned()
        .unwrap_or_else(|| Value::String(conflict.resource.primary().to_string()));

    let mut corrective = CrudOperation::update(
        conflict.resource.collection(),
        json!({ PRIMARY_KEY_FIELD: id }),
        data,
    )
    .with_caller(CONFLICT_RESOLVER)
    .with_clock(conflict.local.clock.merged(&conflict.remote.clock));
    corrective.options.replace = true;
    corrective.options.upsert = true;
    corrective.options.timeout = timeout;
    corrective
}

/// Single envelope for a `batch` operation; `data` holds the item results.
fn batch_envelope(
    operation_id: polyweave_common::OperationId,
    outcome: BatchOutcome,
    consistency: ConsistencyLevel,
) -> CrudResult {
    let metadata = ResultMetadata {
        consistency_level: consistency,
        dispatches: outcome.results.iter().map(|r| r.metadata.dispatches).sum(),
        attempts: outcome.results.iter().map(|r| r.metadata.attempts).sum(),
        ..ResultMetadata::default()
    };

    let data = match serde_json::to_value(&outcome.results) {
        Ok(data) => data,
        Err(e) => return CrudResult::failure(operation_id, &Error::from(e), metadata),
    };

    let error = if outcome.success {
        None
    } else {
        let first = outcome
            .results
            .iter()
            .find_map(|r| r.error.clone())
            .map(|e| (e.code, e.recoverable, e.retry_after));
        first.map(|(code, recoverable, retry_after)| ResultError {
            code,
            message: format!(
                "{} of {} batch items failed",
                outcome.failed,
                outcome.results.len()
            ),
            recoverable,
            retry_after,
        })
    };

    CrudResult {
        operation_id,
        success: outcome.success,
        data: Some(data),
        error,
        metadata,
    }
}
