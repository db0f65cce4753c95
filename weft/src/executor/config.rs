use super::error::Result;
use crate::core::CoreError;
use serde::{Deserialize, Serialize};

/// Configuration for an [`ActivityExecutor`](super::ActivityExecutor).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use weft::executor::ExecutorConfig;
///
/// let config = ExecutorConfig::from_json(r#"{ "persist_exceptions": false }"#).unwrap();
/// assert!(!config.persist_exceptions);
/// assert_eq!(config.work_item_pool_capacity, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// When false, persistence is blocked while a fault is propagating.
    pub persist_exceptions: bool,
    /// Work items kept for reuse. Zero disables pooling.
    pub work_item_pool_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            persist_exceptions: true,
            work_item_pool_capacity: 10,
        }
    }
}

impl ExecutorConfig {
    pub fn with_persist_exceptions(mut self, persist_exceptions: bool) -> Self {
        self.persist_exceptions = persist_exceptions;
        self
    }

    pub fn with_work_item_pool_capacity(mut self, capacity: usize) -> Self {
        self.work_item_pool_capacity = capacity;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json).map_err(CoreError::Deserialization)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert!(config.persist_exceptions);
        assert_eq!(config.work_item_pool_capacity, 10);
    }

    #[test]
    fn test_builder() {
        let config = ExecutorConfig::default()
            .with_persist_exceptions(false)
            .with_work_item_pool_capacity(0);
        assert!(!config.persist_exceptions);
        assert_eq!(config.work_item_pool_capacity, 0);
    }

    #[test]
    fn test_invalid_json_is_a_core_error() {
        let err = ExecutorConfig::from_json("{ not json").unwrap_err();
        assert!(err.to_string().contains("core error"));
    }
}
