//! Location environments.
//!
//! Every activity instance owns one environment holding its arguments and
//! variables. Lookups that miss walk up the parent chain, which is how an
//! activity sees the variables its ancestors declare.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationEnvironment {
    locations: BTreeMap<String, Value>,
}

impl LocationEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `name`, replacing any value it already had.
    pub fn declare(&mut self, name: impl Into<String>, value: Value) {
        self.locations.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.locations.get(name)
    }

    /// Assigns a declared location. Returns false if `name` was never declared.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        match self.locations.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.locations.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.locations.iter()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_requires_declaration() {
        let mut env = LocationEnvironment::new();
        assert!(!env.set("missing", json!(1)));

        env.declare("count", json!(0));
        assert!(env.set("count", json!(2)));
        assert_eq!(env.get("count"), Some(&json!(2)));
        assert_eq!(env.len(), 1);
    }
}
