//! Core types and utilities for the weft workflow engine.
//!
//! # Faults
//! - [`WorkflowFault`]: an exception raised inside a workflow, as data
//! - [`FaultKind`]: its classification, with [`WorkflowFault::is_fatal`]
//!
//! # Serialization
//! - [`serialize_value`] / [`deserialize_value`]: JSON bytes for snapshots
//! - [`stable_hash`]: fingerprint used to detect definition drift
//!
//! # Pooling
//! - [`Pool`] and [`Poolable`]: fixed-capacity LIFO reuse for hot paths
//!
//! # Error Handling
//! - [`CoreError`] and [`Result`]

mod error;
mod fault;
mod pool;
mod serialization;

pub use error::{CoreError, Result};
pub use fault::{FaultKind, WorkflowFault};
pub use pool::{Pool, Poolable};
pub use serialization::{
    deserialize_value, from_workflow_value, serialize_value, stable_hash, to_workflow_value,
};
