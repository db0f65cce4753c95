//! Weft: a durable workflow execution engine.
//!
//! A workflow is a tree of activities. Weft runs one instance of that tree
//! on a cooperative, single-threaded scheduler and can turn the whole
//! in-flight state into data at any persistable point, so the instance can
//! be unloaded and resumed later, possibly in another process.
//!
//! # Features
//!
//! - **Work-item dispatch**: every unit of progress is a queued work item;
//!   activities never run concurrently within an instance
//! - **Bookmarks**: named resumption points, optionally grouped into scopes
//!   that are correlated with host keys
//! - **Fault propagation**: faults travel up the instance tree to the
//!   nearest handler, or reach the host as unhandled
//! - **Cancellation and abort**: cooperative cancel, immediate abort,
//!   host-requested terminate
//! - **Persistence**: snapshots of the complete executor state, a
//!   persistence handshake with the host, and pluggable instance stores
//! - **Tracking**: optional per-event records for audit trails
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use weft::prelude::*;
//!
//! struct Greet;
//!
//! impl Activity for Greet {
//!     fn metadata(&self) -> ActivityMetadata {
//!         ActivityMetadata::new("Greet")
//!             .with_in_argument("Name", ArgumentBinding::None)
//!             .with_result()
//!     }
//!
//!     fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
//!         let name: String = ctx.get_as("Name")?;
//!         ctx.set_result(Value::from(format!("Hello, {name}!")))
//!     }
//! }
//!
//! struct Host(Uuid);
//!
//! impl WorkflowHost for Host {
//!     fn instance_id(&self) -> Uuid {
//!         self.0
//!     }
//! }
//!
//! let mut builder = DefinitionBuilder::new(WorkflowIdentity::new("greet", "1"));
//! let root = builder.add(Greet);
//! let definition = Arc::new(builder.build(root).unwrap());
//!
//! let executor = ActivityExecutor::new(definition, Arc::new(Host(Uuid::new_v4())));
//! let mut arguments = std::collections::BTreeMap::new();
//! arguments.insert("Name".to_string(), Value::from("World"));
//! executor.schedule_root_activity(arguments, Default::default()).unwrap();
//! executor.run().unwrap();
//!
//! assert_eq!(executor.state(), ActivityInstanceState::Closed);
//! assert_eq!(executor.workflow_outputs()["Result"], "Hello, World!");
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: faults, serialization helpers, the object pool
//! - [`definition`]: the [`Activity`] trait and immutable workflow definitions
//! - [`executor`]: the scheduler, work items, bookmarks and the executor handle
//! - [`storage`]: snapshot stores for hosts that persist instances

pub mod core;
pub mod definition;
pub mod executor;
pub mod storage;

pub use core::{
    deserialize_value, from_workflow_value, serialize_value, to_workflow_value, CoreError,
    FaultKind, Pool, Poolable, Result as CoreResult, WorkflowFault,
};

pub use definition::{
    Activity, ActivityId, ActivityMetadata, ArgumentBinding, ArgumentDirection, DefinitionBuilder,
    DefinitionError, WorkflowDefinition, WorkflowIdentity, RESULT_ARGUMENT,
};

pub use executor::{
    AbortContext, ActivityContext, ActivityExecutor, ActivityInstanceRef, ActivityInstanceState,
    Bookmark, BookmarkInfo, BookmarkOptions, BookmarkResumptionResult, BookmarkScope,
    CallbackArgs, ExecutionError, ExecutorConfig, ExecutorSnapshot, InstanceId,
    PersistCompletion, ResolutionContext, Result as ExecutionResult, SynchronizationContext,
    WorkflowHost,
};

pub use storage::{InMemoryInstanceStore, InstanceStore, StorageError, StoredInstance};

// Activities exchange JSON values
pub use serde_json::Value;

// Re-export dependencies used in public API
pub use serde;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use weft::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{FaultKind, WorkflowFault};

    pub use crate::definition::{
        Activity, ActivityId, ActivityMetadata, ArgumentBinding, DefinitionBuilder,
        WorkflowDefinition, WorkflowIdentity, RESULT_ARGUMENT,
    };

    pub use crate::executor::{
        AbortContext, ActivityContext, ActivityExecutor, ActivityInstanceRef,
        ActivityInstanceState, Bookmark, BookmarkOptions, BookmarkResumptionResult,
        BookmarkScope, CallbackArgs, ExecutionError, ExecutorConfig, ExecutorSnapshot,
        InlineSynchronizationContext, InstanceId, PersistCompletion, ResolutionContext,
        TokioSynchronizationContext, WorkflowHost,
    };

    pub use crate::storage::{InMemoryInstanceStore, InstanceStore};

    pub use serde_json::Value;
    pub use uuid::Uuid;
}
