use super::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Compute a stable hash of serialized bytes.
///
/// Uses SeaHash, which is stable across compiler versions, process restarts
/// and machines. A snapshot records the hash of the definition that produced
/// it, and restore compares it against the definition it is given.
///
/// Note: This is NOT cryptographically secure, and does not need to be.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    seahash::hash(bytes)
}

/// Serializes a value to bytes using JSON.
///
/// # Errors
/// Returns `CoreError::Serialization` if the value cannot be serialized.
pub fn serialize_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(CoreError::Serialization)
}

/// Deserializes bytes to a value using JSON.
///
/// # Errors
/// Returns `CoreError::Deserialization` if the bytes cannot be deserialized.
pub fn deserialize_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(CoreError::Deserialization)
}

/// Converts a typed value into the dynamic [`Value`] stored in environments.
pub fn to_workflow_value<T: Serialize>(name: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|source| CoreError::Conversion {
        name: name.to_string(),
        source,
    })
}

/// Converts a dynamic [`Value`] back into a typed value.
pub fn from_workflow_value<T: DeserializeOwned>(name: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|source| CoreError::Conversion {
        name: name.to_string(),
        source,
    })
}
