//! Activity identifier type
//!
//! An `ActivityId` addresses one node of a [`WorkflowDefinition`](super::WorkflowDefinition).
//! Ids are assigned in insertion order by the builder, so the same build code
//! always yields the same ids. Persisted state refers to activities only
//! through these ids.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(u32);

impl ActivityId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActivityId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_id_round_trips_as_plain_number() {
        let id = ActivityId::new(4);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "4");
        let back: ActivityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.index(), 4);
    }
}
