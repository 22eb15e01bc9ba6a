//! Common types shared across Polyweave crates.
//!
//! This crate provides the error taxonomy, identifiers, vector clocks and the
//! operation envelope that every other crate speaks.

pub mod clock;
pub mod error;
pub mod operation;
pub mod types;

pub use clock::{CausalOrder, RecordVersion, VectorClock};
pub use error::{Error, ErrorCode, Result};
pub use operation::{
    ConsistencyLevel, CrudOperation, CrudResult, OperationKind, OperationMetadata,
    OperationOptions, ReplicationStatus, ResultError, ResultMetadata, SortKey,
};
pub use types::{
    matches_filter, ConflictId, OperationId, OptimisticId, ResourceKey, PRIMARY_KEY_FIELD,
};
