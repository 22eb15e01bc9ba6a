//! Replica propagation under a consistency level.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use polyweave_common::{
    ConsistencyLevel, CrudOperation, Error, OperationId, OperationKind, ReplicationStatus, Result,
    VectorClock,
};
use polyweave_storage::{ProviderDescriptor, ProviderRegistry};

use crate::events::{EngineEvent, EventBus};
use crate::retry::RetryConfig;

/// Result of fanning one write out to its replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationOutcome {
    pub status: ReplicationStatus,
    /// Replica dispatches started by this call.
    pub dispatches: u32,
    pub acknowledged: Vec<String>,
    pub failed: Vec<String>,
}

impl ReplicationOutcome {
    fn empty(status: ReplicationStatus) -> Self {
        Self {
            status,
            dispatches: 0,
            acknowledged: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// A replica write waiting for a background retry.
#[derive(Debug, Clone)]
struct PendingReplica {
    operation: CrudOperation,
    target: String,
    /// Attempts made so far, the initial dispatch included.
    attempts: u32,
    next_attempt: Instant,
}

/// Propagates confirmed writes to replica providers.
pub struct ReplicationCoordinator {
    registry: Arc<ProviderRegistry>,
    events: EventBus,
    retry: RetryConfig,
    max_attempts: u32,
    bounded_timeout: Duration,
    call_timeout: Duration,
    backlog: Arc<Mutex<Vec<PendingReplica>>>,
}

impl ReplicationCoordinator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        events: EventBus,
        retry: RetryConfig,
        max_attempts: u32,
        bounded_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            retry,
            max_attempts: max_attempts.max(1),
            bounded_timeout,
            call_timeout,
            backlog: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build the write sent to replicas from the confirmed primary write.
    ///
    /// Creates become upserts so retried replicas stay idempotent. Causal
    /// replicas carry the clock the primary assigned.
    pub fn replica_operation(
        confirmed: &CrudOperation,
        primary_clock: Option<&VectorClock>,
        consistency: ConsistencyLevel,
    ) -> CrudOperation {
        let mut replica = confirmed.clone();
        replica.id = OperationId::generate();
        replica.provider = None;
        replica.metadata.optimistic = false;
        if replica.kind == OperationKind::Create {
            replica.options.upsert = true;
        }
        if consistency == ConsistencyLevel::Causal {
            if let Some(clock) = primary_clock {
                replica.metadata.vector_clock = Some(clock.clone());
            }
        }
        replica
    }

    /// Fan `replica` out to `targets`.
    ///
    /// `wanted` is the number of replicas the replication factor asks for;
    /// fewer targets report `Partial`. Failed targets go to the retry backlog
    /// and never fail the caller.
    ///
    /// # Errors
    /// - `Error::Cancelled` if `cancel` fired before any dispatch started
    pub async fn replicate(
        &self,
        replica: &CrudOperation,
        targets: &[ProviderDescriptor],
        wanted: usize,
        consistency: ConsistencyLevel,
        cancel: &CancellationToken,
    ) -> Result<ReplicationOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!(
                "replication of {} cancelled before dispatch",
                replica.id
            )));
        }

        if wanted == 0 {
            return Ok(ReplicationOutcome::empty(ReplicationStatus::Completed));
        }
        if targets.is_empty() {
            warn!(operation = %replica.id, wanted, "No replica targets available");
            return Ok(ReplicationOutcome::empty(ReplicationStatus::Partial));
        }

        debug!(
            operation = %replica.id,
            targets = targets.len(),
            consistency = ?consistency,
            "Replicating write"
        );

        let handles: Vec<_> = targets
            .iter()
            .map(|target| {
                let registry = Arc::clone(&self.registry);
                let events = self.events.clone();
                let backlog = Arc::clone(&self.backlog);
                let operation = replica.clone();
                let target = target.name.clone();
                let call_timeout = self.call_timeout;
                let next_attempt = Instant::now() + self.retry.backoff(0);
                tokio::spawn(async move {
                    let result = dispatch(&registry, &operation, &target, call_timeout).await;
                    let acknowledged = result.is_ok();
                    record_attempt(&events, &operation, &target, result);
                    if !acknowledged {
                        backlog.lock().push(PendingReplica {
                            operation,
                            target: target.clone(),
                            attempts: 1,
                            next_attempt,
                        });
                    }
                    (target, acknowledged)
                })
            })
            .collect();
        let dispatches = handles.len() as u32;
        let short = targets.len() < wanted;

        let settled = match consistency {
            ConsistencyLevel::Strong => Some(join_all(handles).await),
            ConsistencyLevel::Bounded => {
                match tokio::time::timeout(self.bounded_timeout, join_all(handles)).await {
                    Ok(settled) => Some(settled),
                    Err(_) => {
                        debug!(operation = %replica.id, "Bounded replication window elapsed");
                        None
                    }
                }
            }
            ConsistencyLevel::Eventual | ConsistencyLevel::Causal => None,
        };

        let Some(settled) = settled else {
            return Ok(ReplicationOutcome {
                status: ReplicationStatus::Pending,
                dispatches,
                acknowledged: Vec::new(),
                failed: Vec::new(),
            });
        };

        let mut acknowledged = Vec::new();
        let mut failed = Vec::new();
        for joined in settled {
            match joined {
                Ok((target, true)) => acknowledged.push(target),
                Ok((target, false)) => failed.push(target),
                Err(e) => warn!("Replica task failed to join: {}", e),
            }
        }

        let status = if acknowledged.is_empty() {
            ReplicationStatus::Failed
        } else if failed.is_empty() && !short && acknowledged.len() == targets.len() {
            ReplicationStatus::Completed
        } else {
            ReplicationStatus::Partial
        };

        Ok(ReplicationOutcome {
            status,
            dispatches,
            acknowledged,
            failed,
        })
    }

    /// Retry due backlog entries once; returns the number acknowledged.
    ///
    /// Entries that reach the attempt limit are dropped and announced as
    /// abandoned.
    pub async fn retry_pending(&self) -> usize {
        let now = Instant::now();
        let due: Vec<PendingReplica> = {
            let mut backlog = self.backlog.lock();
            let (due, waiting): (Vec<_>, Vec<_>) =
                backlog.drain(..).partition(|p| p.next_attempt <= now);
            *backlog = waiting;
            due
        };
        if due.is_empty() {
            return 0;
        }

        let attempts = due.into_iter().map(|mut pending| async move {
            let result = dispatch(
                &self.registry,
                &pending.operation,
                &pending.target,
                self.call_timeout,
            )
            .await;
            pending.attempts += 1;
            let acknowledged = result.is_ok();
            record_attempt(&self.events, &pending.operation, &pending.target, result);
            (pending, acknowledged)
        });

        let mut succeeded = 0;
        let mut requeue = Vec::new();
        for (mut pending, acknowledged) in join_all(attempts).await {
            if acknowledged {
                succeeded += 1;
            } else if pending.attempts >= self.max_attempts {
                warn!(
                    operation = %pending.operation.id,
                    provider = %pending.target,
                    attempts = pending.attempts,
                    "Abandoning replica write"
                );
                self.events.publish(EngineEvent::ReplicationAbandoned {
                    operation_id: pending.operation.id.clone(),
                    target: pending.target.clone(),
                    attempts: pending.attempts,
                });
            } else {
                pending.next_attempt =
                    Instant::now() + self.retry.backoff(pending.attempts - 1);
                requeue.push(pending);
            }
        }

        if !requeue.is_empty() {
            self.backlog.lock().extend(requeue);
        }
        if succeeded > 0 {
            info!("Replica retry pass: {} acknowledged", succeeded);
        }
        succeeded
    }

    /// Replica writes awaiting retry.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }
}

async fn dispatch(
    registry: &ProviderRegistry,
    operation: &CrudOperation,
    target: &str,
    call_timeout: Duration,
) -> Result<()> {
    let adapter = registry.adapter(target)?;
    match tokio::time::timeout(call_timeout, adapter.execute(operation)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(Error::Timeout(call_timeout)),
    }
}

fn record_attempt(events: &EventBus, operation: &CrudOperation, target: &str, result: Result<()>) {
    match result {
        Ok(()) => {
            debug!(operation = %operation.id, provider = target, "Replica acknowledged");
            events.publish(EngineEvent::ReplicationCompleted {
                operation_id: operation.id.clone(),
                target: target.to_string(),
            });
        }
        Err(e) => {
            warn!(operation = %operation.id, provider = target, "Replica write failed: {}", e);
            events.publish(EngineEvent::ReplicationFailed {
                operation_id: operation.id.clone(),
                target: target.to_string(),
                error: e.to_string(),
            });
        }
    }
}
