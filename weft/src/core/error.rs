use thiserror::Error;

/// Core error type for the weft workflow engine.
///
/// This error type uses `thiserror` with proper `#[source]` annotations
/// to preserve error chains for debugging and error handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Serialization failed when encoding a value to bytes.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding bytes to a value.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),

    /// A value did not have the shape the caller asked for.
    #[error("value conversion failed for '{name}'")]
    Conversion {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// The workflow definition changed incompatibly between save and load.
    #[error("incompatible workflow definition: expected hash {expected:#018x}, found {found:#018x}")]
    DefinitionMismatch { expected: u64, found: u64 },
}

pub type Result<T> = std::result::Result<T, CoreError>;
