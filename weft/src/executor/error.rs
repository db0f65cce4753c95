use crate::core::{CoreError, WorkflowFault};
use crate::definition::{ActivityId, DefinitionError};
use crate::storage::StorageError;
use thiserror::Error;

/// Execution layer error type for the weft workflow engine.
///
/// These are engine-level failures. Faults raised by activity logic are not
/// errors at this level: they travel through the instance tree as
/// [`WorkflowFault`] values and only surface here when they are fatal.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// A fatal fault escaped activity code; the workflow cannot continue.
    #[error("fatal fault: {0}")]
    Fatal(WorkflowFault),

    /// A host-supplied callback failed.
    #[error("host callback failed: {0}")]
    Callback(WorkflowFault),

    /// An engine invariant was violated.
    #[error("internal consistency failure: {0}")]
    Internal(String),

    /// The call is not valid in the executor's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// `make_non_serializable` was called; snapshots are refused.
    #[error("workflow instance is not serializable in its current state")]
    NonSerializable,

    /// The snapshot was taken from a different workflow definition.
    #[error("workflow identity mismatch: snapshot has {expected}, definition is {found}")]
    IdentityMismatch { expected: String, found: String },

    /// A persisted callback no longer names a handler of its activity.
    #[error("callback '{handler}' of activity {activity} cannot be rebound")]
    CallbackRebind { activity: ActivityId, handler: String },

    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(String),

    /// The workflow definition is invalid.
    #[error("definition error: {0}")]
    Definition(String),

    /// A storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ExecutionError {
    pub fn internal(message: impl Into<String>) -> Self {
        ExecutionError::Internal(message.into())
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        ExecutionError::InvalidOperation(message.into())
    }

    /// The fault recorded when this error aborts a workflow instance.
    pub fn to_fault(&self) -> WorkflowFault {
        match self {
            ExecutionError::Fatal(fault) => fault.clone(),
            ExecutionError::Callback(fault) => fault.clone(),
            other => WorkflowFault::fatal(other.to_string()),
        }
    }
}

// Manual From implementations to convert nested errors to strings
impl From<CoreError> for ExecutionError {
    fn from(e: CoreError) -> Self {
        ExecutionError::Core(e.to_string())
    }
}

impl From<DefinitionError> for ExecutionError {
    fn from(e: DefinitionError) -> Self {
        ExecutionError::Definition(e.to_string())
    }
}

impl From<StorageError> for ExecutionError {
    fn from(e: StorageError) -> Self {
        ExecutionError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
