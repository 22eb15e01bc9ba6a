//! Orchestration engine for Polyweave.
//!
//! This crate turns a set of registered providers into one CRUD surface:
//! provider selection, result caching, optimistic writes, conflict handling,
//! replica propagation and performance tracking.
//!
//! # Features
//! - Deterministic provider ranking with capability and region affinity
//! - LRU/LFU/FIFO/TTL result cache with single-flight reads
//! - Optimistic writes with targeted cache rollback and TTL expiry
//! - Vector-clock conflict detection with pluggable resolution
//! - Eventual, strong, bounded and causal replication
//! - Retry with exponential backoff for recoverable failures

pub mod cache;
pub mod config;
pub mod conflict;
pub mod events;
pub mod executor;
pub mod locks;
pub mod metrics;
pub mod optimistic;
pub mod replication;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod shard;

pub use cache::{cache_key, CacheConfig, CacheStats, EvictionPolicy, ResultCache};
pub use config::OrchestratorConfig;
pub use conflict::{
    ConflictDetector, ConflictQueue, ConflictRecord, ConflictResolver, ConflictStrategy, Decision,
    MergeRegistry, Resolution,
};
pub use events::{EngineEvent, EventBus};
pub use executor::{BatchOutcome, Executor};
pub use metrics::{MetricsSnapshot, PerformanceMonitor};
pub use optimistic::{OptimisticState, OptimisticTracker};
pub use replication::{ReplicationCoordinator, ReplicationOutcome};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::BackgroundTasks;
pub use selector::{ProviderSelector, ReadPreference, Selection};
pub use shard::{ShardRouter, ShardStrategy};
