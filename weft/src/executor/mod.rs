//! The execution engine.
//!
//! An [`ActivityExecutor`] owns one workflow instance: the tree of activity
//! instances, the scheduler queue, the bookmark tables and the no-persist
//! bookkeeping. Activities never run concurrently within an instance; every
//! unit of progress is a work item dispatched by the cooperative run loop in
//! [`scheduler`].
//!
//! # Main Types
//!
//! - [`ActivityExecutor`]: the handle hosts drive
//! - [`WorkflowHost`]: everything the executor asks of its host
//! - [`ActivityContext`]: what an activity sees while it runs
//! - [`Bookmark`], [`BookmarkScope`]: named resumption points
//! - [`ExecutorSnapshot`], [`PersistCompletion`]: persistence
//! - [`SynchronizationContext`]: where the run loop executes
//!
//! # Error Handling
//!
//! Faults raised by activity code are data ([`WorkflowFault`](crate::core::WorkflowFault))
//! and travel up the instance tree. [`ExecutionError`] covers misuse of the
//! executor and restore failures.

mod activity_executor;
mod bookmark;
mod bookmark_scope;
mod callback;
mod config;
mod context;
mod environment;
mod error;
mod host;
mod instance;
mod persistence;
mod runtime;
pub mod scheduler;
mod sync_context;
mod tracking;
mod work_item;

pub use activity_executor::ActivityExecutor;
pub use bookmark::{
    Bookmark, BookmarkInfo, BookmarkManager, BookmarkOptions, BookmarkResumptionResult,
    ExclusiveHandleId,
};
pub use bookmark_scope::{BookmarkScope, BookmarkScopeManager};
pub use callback::{
    BookmarkCallback, CallbackArgs, CallbackWrapper, CompletionCallback, FaultCallback,
};
pub use config::ExecutorConfig;
pub use context::{AbortContext, ActivityContext, ResolutionContext};
pub use environment::LocationEnvironment;
pub use error::{ExecutionError, Result};
pub use host::{Extension, HostExtensions, WorkflowHost};
pub use instance::{ActivityInstanceRef, ActivityInstanceState, InstanceId};
pub use persistence::{ExecutorSnapshot, PersistCompletion};
pub use scheduler::{RequestedAction, SchedulerOwner};
pub use sync_context::{
    InlineSynchronizationContext, PostedWork, SynchronizationContext,
    TokioSynchronizationContext,
};
pub use tracking::{
    InMemoryTrackingProvider, TrackingProvider, TrackingRecord, TrackingRecordKind,
    WorkflowInstanceRecordState,
};
