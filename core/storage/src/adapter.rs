//! Backend adapter contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use polyweave_common::{CrudOperation, RecordVersion, Result};

use crate::descriptor::ConnectionConfig;

/// Raw outcome of executing one operation against a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    /// Returned records.
    pub data: Value,
    /// Number of records read or written.
    pub affected: u64,
    /// Version of the (first) target record after the operation.
    pub version: Option<RecordVersion>,
    /// Version the backend held immediately before a write.
    pub previous: Option<RecordVersion>,
}

impl RawResult {
    pub fn new(data: Value, affected: u64) -> Self {
        Self {
            data,
            affected,
            version: None,
            previous: None,
        }
    }
}

/// Contract every concrete store implements.
///
/// The executor depends only on this trait, never on a backend's native API.
/// Implementations handle their own authentication and wire protocol and map
/// transient failures to `Error::Recoverable`.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Adapter instance name (normally the provider name).
    fn name(&self) -> &str;

    /// Open the connection.
    ///
    /// # Errors
    /// - `Error::Fatal` for authentication or configuration problems
    /// - `Error::Recoverable` for transient network errors
    async fn connect(&self, config: &ConnectionConfig) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Execute a single create/read/update/delete operation.
    ///
    /// # Preconditions
    /// - The adapter is connected
    /// - The operation has passed validation and is not a batch envelope
    async fn execute(&self, operation: &CrudOperation) -> Result<RawResult>;

    /// Capability tags this backend supports.
    fn capabilities(&self) -> BTreeSet<String>;
}
