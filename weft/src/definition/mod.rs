//! Workflow definitions and the activity boundary.
//!
//! - [`Activity`]: the trait authored activities implement
//! - [`ActivityMetadata`]: arguments, variables, children and callbacks of a node
//! - [`WorkflowDefinition`]: the validated, immutable activity arena
//! - [`DefinitionBuilder`]: builds one bottom-up
//! - [`DefinitionError`]: validation failures

mod activity;
mod activity_id;
mod error;
mod workflow;

pub use activity::{
    Activity, ActivityMetadata, ArgumentBinding, ArgumentDirection, ArgumentSpec, VariableSpec,
    RESULT_ARGUMENT,
};
pub use activity_id::ActivityId;
pub use error::{DefinitionError, DefinitionResult};
pub use workflow::{DefinitionBuilder, WorkflowDefinition, WorkflowIdentity};
