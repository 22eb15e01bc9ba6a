//! Shard routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use polyweave_common::{CrudOperation, Error, Result};

use crate::config::ShardingConfig;

/// How a shard key value maps to a shard index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShardStrategy {
    /// CRC32 of the key value modulo the shard count.
    Hash,
    /// Shard `i` holds values below `boundaries[i]`; the last shard holds the rest.
    Range { boundaries: Vec<f64> },
    /// Explicit key to shard map.
    Directory {
        #[serde(default)]
        entries: BTreeMap<String, u32>,
        #[serde(default)]
        fallback: u32,
    },
}

/// Maps operations to shard indexes.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    config: ShardingConfig,
}

impl ShardRouter {
    pub fn new(config: ShardingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn shard_count(&self) -> u32 {
        self.config.shard_count
    }

    /// Shard of the operation, or `None` when it carries no shard key.
    ///
    /// # Errors
    /// - `Error::Validation` if range sharding meets a non-numeric key
    pub fn route(&self, operation: &CrudOperation) -> Result<Option<u32>> {
        let key = &self.config.shard_key;
        let value = operation
            .filter
            .as_ref()
            .and_then(|f| f.get(key))
            .or_else(|| operation.data.as_ref().and_then(|d| d.get(key)));

        let Some(value) = value else {
            return Ok(None);
        };
        self.shard_for(value).map(Some)
    }

    /// Shard of a single key value.
    pub fn shard_for(&self, value: &Value) -> Result<u32> {
        match &self.config.strategy {
            ShardStrategy::Hash => {
                let hash = crc32fast::hash(key_text(value).as_bytes());
                Ok(hash % self.config.shard_count)
            }
            ShardStrategy::Range { boundaries } => {
                let number = value.as_f64().ok_or_else(|| {
                    Error::Validation(format!(
                        "shard key '{}' must be numeric for range sharding",
                        self.config.shard_key
                    ))
                })?;
                let index = boundaries
                    .iter()
                    .position(|b| *b > number)
                    .unwrap_or(boundaries.len());
                Ok(index as u32)
            }
            ShardStrategy::Directory { entries, fallback } => Ok(entries
                .get(&key_text(value))
                .copied()
                .unwrap_or(*fallback)),
        }
    }
}

fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
