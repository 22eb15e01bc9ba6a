//! Orchestrator configuration.
//!
//! Loaded once from JSON and validated at load time; nothing here is
//! re-checked per operation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use polyweave_common::{ConsistencyLevel, Error, Result};
use polyweave_storage::{BackendKind, ConnectionConfig, ProviderDescriptor};

use crate::cache::EvictionPolicy;
use crate::conflict::ConflictStrategy;
use crate::retry::RetryConfig;
use crate::selector::ReadPreference;
use crate::shard::ShardStrategy;

/// One configured provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub regions: BTreeSet<String>,
}

impl ProviderConfig {
    pub fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: self.name.clone(),
            kind: self.kind,
            priority: self.priority,
            enabled: self.enabled,
            capabilities: self.capabilities.clone(),
            regions: self.regions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfig {
    #[serde(flatten)]
    pub strategy: ShardStrategy,
    /// Field looked up in the filter, then the payload.
    pub shard_key: String,
    pub shard_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Providers holding a copy, primary included.
    #[serde(default = "default_replication_factor")]
    pub factor: usize,
    #[serde(default)]
    pub consistency: ConsistencyLevel,
    #[serde(default)]
    pub read_preference: ReadPreference,
    /// How long bounded consistency waits for replicas.
    #[serde(default = "default_bounded_timeout_ms")]
    pub bounded_timeout_ms: u64,
    /// Attempts per failed replica write before it is abandoned.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl ReplicationConfig {
    pub fn bounded_timeout(&self) -> Duration {
        Duration::from_millis(self.bounded_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        let initial = Duration::from_millis(self.retry_backoff_ms);
        RetryConfig::new(self.retry_attempts).with_backoff(initial, initial.saturating_mul(64))
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: default_replication_factor(),
            consistency: ConsistencyLevel::default(),
            read_preference: ReadPreference::default(),
            bounded_timeout_ms: default_bounded_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entry lifetime; 0 keeps entries until evicted.
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

impl CachingConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then(|| Duration::from_millis(self.ttl_ms))
    }
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: default_cache_ttl_ms(),
            max_entries: default_max_entries(),
            eviction: EvictionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictConfig {
    #[serde(default)]
    pub strategy: ConflictStrategy,
    /// Compare vector clocks when both versions carry one.
    #[serde(default = "default_true")]
    pub vector_clocks: bool,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            vector_clocks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Provider call timeout for operations that set none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_backoff(
                Duration::from_millis(self.initial_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            )
            .with_jitter(self.jitter)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticConfig {
    /// Lifetime of an unconfirmed optimistic record.
    #[serde(default = "default_optimistic_ttl_ms")]
    pub ttl_ms: u64,
    /// How long confirmed and rolled-back records stay queryable.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
}

impl OptimisticConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_optimistic_ttl_ms(),
            retention_ms: default_retention_ms(),
        }
    }
}

/// Periods of the background tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_conflict_queue_interval_ms")]
    pub conflict_queue_interval_ms: u64,
    #[serde(default = "default_aggregator_interval_ms")]
    pub aggregator_interval_ms: u64,
    #[serde(default = "default_replication_retry_interval_ms")]
    pub replication_retry_interval_ms: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            conflict_queue_interval_ms: default_conflict_queue_interval_ms(),
            aggregator_interval_ms: default_aggregator_interval_ms(),
            replication_retry_interval_ms: default_replication_retry_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Sliding window the snapshot is computed over.
    #[serde(default = "default_metrics_window_ms")]
    pub window_ms: u64,
    /// Hard cap on retained samples.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_ms: default_metrics_window_ms(),
            max_samples: default_max_samples(),
        }
    }
}

/// Top-level configuration of the orchestration layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Implicit hint for operations with no hint and no constraints.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Region the selector treats as local.
    #[serde(default)]
    pub local_region: Option<String>,
    #[serde(default)]
    pub sharding: Option<ShardingConfig>,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub caching: CachingConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub optimistic: OptimisticConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl OrchestratorConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Check cross-field constraints.
    ///
    /// Merge-function references are checked later, against the registry the
    /// executor is built with.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(Error::Config("provider name cannot be empty".to_string()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(Error::Config(format!(
                    "provider '{}' is configured twice",
                    provider.name
                )));
            }
            provider.connection.validate_for(provider.kind)?;
        }

        if let Some(default) = &self.default_provider {
            if !names.contains(default.as_str()) {
                return Err(Error::Config(format!(
                    "default provider '{}' is not configured",
                    default
                )));
            }
        }

        if self.replication.factor == 0 {
            return Err(Error::Config(
                "replication factor must be at least 1".to_string(),
            ));
        }
        if self.caching.max_entries == 0 {
            return Err(Error::Config("cache max entries must be at least 1".to_string()));
        }
        if self.executor.default_timeout_ms == 0 {
            return Err(Error::Config("default timeout must be positive".to_string()));
        }
        if self.metrics.window_ms == 0 || self.metrics.max_samples == 0 {
            return Err(Error::Config("metrics window must be positive".to_string()));
        }

        let background = &self.background;
        let intervals = [
            background.sweep_interval_ms,
            background.conflict_queue_interval_ms,
            background.aggregator_interval_ms,
            background.replication_retry_interval_ms,
        ];
        if intervals.contains(&0) {
            return Err(Error::Config(
                "background intervals must be positive".to_string(),
            ));
        }

        if let Some(sharding) = &self.sharding {
            sharding.validate()?;
        }

        Ok(())
    }
}

impl ShardingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shard_key.is_empty() {
            return Err(Error::Config("shard key cannot be empty".to_string()));
        }
        if self.shard_count == 0 {
            return Err(Error::Config("shard count must be at least 1".to_string()));
        }
        match &self.strategy {
            ShardStrategy::Hash => Ok(()),
            ShardStrategy::Range { boundaries } => {
                if boundaries.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(Error::Config(
                        "range boundaries must be strictly ascending".to_string(),
                    ));
                }
                if boundaries.len() + 1 != self.shard_count as usize {
                    return Err(Error::Config(format!(
                        "{} range boundaries define {} shards, not {}",
                        boundaries.len(),
                        boundaries.len() + 1,
                        self.shard_count
                    )));
                }
                Ok(())
            }
            ShardStrategy::Directory { entries, fallback } => {
                let out_of_range = entries
                    .values()
                    .chain(std::iter::once(fallback))
                    .any(|shard| *shard >= self.shard_count);
                if out_of_range {
                    return Err(Error::Config(
                        "directory maps a key outside the shard count".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_replication_factor() -> usize {
    1
}

fn default_bounded_timeout_ms() -> u64 {
    500
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}

fn default_max_entries() -> usize {
    1000
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_optimistic_ttl_ms() -> u64 {
    30_000
}

fn default_retention_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_conflict_queue_interval_ms() -> u64 {
    500
}

fn default_aggregator_interval_ms() -> u64 {
    1_000
}

fn default_replication_retry_interval_ms() -> u64 {
    250
}

fn default_metrics_window_ms() -> u64 {
    60_000
}

fn default_max_samples() -> usize {
    10_000
}
