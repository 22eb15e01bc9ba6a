//! Backend abstraction for Polyweave.
//!
//! This crate defines the narrow adapter contract every concrete store
//! implements, the static descriptors of configured providers, and the
//! registry that owns them.
//!
//! # Design Principles
//! - Provider isolation: the engine never touches a backend's native API
//! - Async operations: all backend I/O is async
//! - Unified error semantics: adapters map failures onto the common taxonomy

pub mod adapter;
pub mod descriptor;
pub mod memory;
pub mod registry;

pub use adapter::{BackendAdapter, RawResult};
pub use descriptor::{BackendKind, ConnectionConfig, ProviderDescriptor};
pub use memory::{FaultKind, MemoryAdapter};
pub use registry::{
    create_default_factories, AdapterFactories, AdapterFactory, InitReport, ProviderFilter,
    ProviderRegistry, ProviderState,
};
