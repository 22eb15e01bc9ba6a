//! Provider descriptors and connection configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use polyweave_common::{Error, Result};

/// Family of backend a provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sql,
    Nosql,
    Graph,
    Cache,
    Search,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Sql => "sql",
            BackendKind::Nosql => "nosql",
            BackendKind::Graph => "graph",
            BackendKind::Cache => "cache",
            BackendKind::Search => "search",
        };
        write!(f, "{}", name)
    }
}

/// Static metadata of a configured provider.
///
/// Immutable after registration; administrative changes replace the whole
/// descriptor through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: BackendKind,
    /// Lower is preferred.
    pub priority: u32,
    pub enabled: bool,
    pub capabilities: BTreeSet<String>,
    pub regions: BTreeSet<String>,
}

impl ProviderDescriptor {
    /// Create an enabled descriptor with priority 0 and no tags.
    pub fn new(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: 0,
            enabled: true,
            capabilities: BTreeSet::new(),
            regions: BTreeSet::new(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// True if every required tag is carried by this provider.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    pub fn serves_region(&self, region: &str) -> bool {
        self.regions.contains(region)
    }

    /// Check the descriptor's own fields.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("provider name cannot be empty".to_string()));
        }
        if self.capabilities.iter().any(|c| c.is_empty()) {
            return Err(Error::Config(format!(
                "provider '{}' has an empty capability tag",
                self.name
            )));
        }
        Ok(())
    }
}

/// Connection settings, one variant per driver.
///
/// The set is closed; each variant is only valid for its backend kind,
/// except `Memory`, which can stand in for any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// In-process reference store.
    Memory {
        #[serde(default)]
        latency_ms: u64,
    },
    Postgres {
        url: String,
        #[serde(default = "default_pool_size")]
        pool_size: u32,
    },
    Mongo {
        uri: String,
        database: String,
    },
    Neo4j {
        uri: String,
        #[serde(default)]
        user: Option<String>,
    },
    Redis {
        url: String,
    },
    Elasticsearch {
        endpoint: String,
    },
}

fn default_pool_size() -> u32 {
    8
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::Memory { latency_ms: 0 }
    }
}

impl ConnectionConfig {
    /// Driver name used to look up an adapter factory.
    pub fn driver(&self) -> &'static str {
        match self {
            ConnectionConfig::Memory { .. } => "memory",
            ConnectionConfig::Postgres { .. } => "postgres",
            ConnectionConfig::Mongo { .. } => "mongo",
            ConnectionConfig::Neo4j { .. } => "neo4j",
            ConnectionConfig::Redis { .. } => "redis",
            ConnectionConfig::Elasticsearch { .. } => "elasticsearch",
        }
    }

    /// Check that this driver can serve the given backend kind.
    pub fn validate_for(&self, kind: BackendKind) -> Result<()> {
        let expected = match self {
            ConnectionConfig::Memory { .. } => return Ok(()),
            ConnectionConfig::Postgres { url, .. } => {
                require_non_empty("url", url)?;
                BackendKind::Sql
            }
            ConnectionConfig::Mongo { uri, database } => {
                require_non_empty("uri", uri)?;
                require_non_empty("database", database)?;
                BackendKind::Nosql
            }
            ConnectionConfig::Neo4j { uri, .. } => {
                require_non_empty("uri", uri)?;
                BackendKind::Graph
            }
            ConnectionConfig::Redis { url } => {
                require_non_empty("url", url)?;
                BackendKind::Cache
            }
            ConnectionConfig::Elasticsearch { endpoint } => {
                require_non_empty("endpoint", endpoint)?;
                BackendKind::Search
            }
        };

        if expected != kind {
            return Err(Error::Config(format!(
                "driver '{}' serves {} backends, not {}",
                self.driver(),
                expected,
                kind
            )));
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("connection field '{}' is empty", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_capabilities() {
        let d = ProviderDescriptor::new("pg", BackendKind::Sql)
            .with_capabilities(["transactions", "joins"])
            .with_regions(["us"]);

        assert!(d.has_capabilities(&["joins".to_string()]));
        assert!(!d.has_capabilities(&["graph".to_string()]));
        assert!(d.has_capabilities(&[]));
        assert!(d.serves_region("us"));
        assert!(!d.serves_region("eu"));
    }

    #[test]
    fn test_connection_config_tagged() {
        let config: ConnectionConfig =
            serde_json::from_value(json!({"driver": "postgres", "url": "postgres://db"})).unwrap();
        assert_eq!(
            config,
            ConnectionConfig::Postgres {
                url: "postgres://db".to_string(),
                pool_size: 8
            }
        );
        assert_eq!(config.driver(), "postgres");
    }

    #[test]
    fn test_driver_kind_mismatch() {
        let config = ConnectionConfig::Redis {
            url: "redis://cache".to_string(),
        };
        assert!(config.validate_for(BackendKind::Cache).is_ok());
        assert!(config.validate_for(BackendKind::Sql).is_err());
        assert!(ConnectionConfig::default().validate_for(BackendKind::Graph).is_ok());
    }

    #[test]
    fn test_empty_connection_field() {
        let config = ConnectionConfig::Mongo {
            uri: "mongodb://x".to_string(),
            database: String::new(),
        };
        assert!(config.validate_for(BackendKind::Nosql).is_err());
    }
}
