//! Error types for definition building
//!
//! This module hides error representation details and provides
//! a unified error type for all definition validation failures.

use super::ActivityId;
use crate::core::CoreError;
use thiserror::Error;

/// Result type for definition operations
pub type DefinitionResult<T> = Result<T, DefinitionError>;

/// Errors that can occur while building a workflow definition
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DefinitionError {
    /// No activity was added before `build`
    #[error("Definition is empty - no activities added")]
    EmptyDefinition,

    /// An id does not name an activity of this definition
    #[error("Activity not found: {id}")]
    ActivityNotFound {
        /// The id that was not found
        id: ActivityId,
    },

    /// An activity was declared as the child of two parents
    #[error("Activity {child} is declared by both {first} and {second}")]
    MultipleParents {
        child: ActivityId,
        first: ActivityId,
        second: ActivityId,
    },

    /// The root was declared as somebody's child
    #[error("Root activity {root} cannot be the child of {parent}")]
    RootHasParent { root: ActivityId, parent: ActivityId },

    /// An activity cannot be reached from the root
    #[error("Activity {id} is not reachable from the root")]
    Unreachable { id: ActivityId },

    /// Two callbacks of one activity share a name
    #[error("Activity {activity} registers callback '{name}' twice")]
    DuplicateCallback { activity: ActivityId, name: String },

    /// Two arguments or variables of one activity share a name
    #[error("Activity {activity} declares location '{name}' twice")]
    DuplicateLocation { activity: ActivityId, name: String },

    /// Hashing the definition failed
    #[error("could not fingerprint definition")]
    Core(#[from] CoreError),
}

impl DefinitionError {
    /// Creates an activity not found error
    pub fn activity_not_found(id: ActivityId) -> Self {
        Self::ActivityNotFound { id }
    }

    /// Creates a multiple parents error
    pub fn multiple_parents(child: ActivityId, first: ActivityId, second: ActivityId) -> Self {
        Self::MultipleParents {
            child,
            first,
            second,
        }
    }

    /// Creates a duplicate callback error
    pub fn duplicate_callback(activity: ActivityId, name: impl Into<String>) -> Self {
        Self::DuplicateCallback {
            activity,
            name: name.into(),
        }
    }

    /// Creates a duplicate location error
    pub fn duplicate_location(activity: ActivityId, name: impl Into<String>) -> Self {
        Self::DuplicateLocation {
            activity,
            name: name.into(),
        }
    }
}
