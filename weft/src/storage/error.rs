use crate::core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer error type for the weft workflow engine.
///
/// This error type wraps underlying serialization errors while preserving
/// the full error chain for debugging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The requested workflow instance was not found in storage.
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, StorageError>;
