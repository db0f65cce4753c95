//! The activity boundary.
//!
//! The engine treats an activity as an opaque node: it reads the node's
//! [`ActivityMetadata`] once when the definition is built, and afterwards only
//! calls the entry points of the [`Activity`] trait. Everything an activity
//! does to the running workflow (scheduling children, creating bookmarks,
//! reading and writing locations) goes through the context it is handed.

use super::ActivityId;
use crate::core::WorkflowFault;
use crate::executor::{AbortContext, ActivityContext, CallbackArgs, ResolutionContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the Out argument that carries an activity's result.
pub const RESULT_ARGUMENT: &str = "Result";

/// Direction of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgumentDirection {
    In,
    Out,
    InOut,
}

impl ArgumentDirection {
    /// True for arguments whose value is read when the activity starts.
    pub fn is_input(&self) -> bool {
        matches!(self, ArgumentDirection::In | ArgumentDirection::InOut)
    }

    /// True for arguments whose value is copied out when the activity closes.
    pub fn is_output(&self) -> bool {
        matches!(self, ArgumentDirection::Out | ArgumentDirection::InOut)
    }
}

/// What an argument is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgumentBinding {
    /// Unbound. Inputs start as `null` unless the host overrides them on the root.
    None,
    /// A constant.
    Literal(Value),
    /// A variable declared by an ancestor, looked up by name.
    Variable(String),
    /// An expression activity evaluated when the owner starts.
    Expression(ActivityId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    pub direction: ArgumentDirection,
    pub binding: ArgumentBinding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub default: Value,
}

/// Cached description of an activity node.
///
/// Built with the chained `with_*` methods:
///
/// ```
/// use weft::definition::{ActivityMetadata, ArgumentBinding};
/// use serde_json::json;
///
/// let metadata = ActivityMetadata::new("Counter")
///     .with_variable("count", json!(0))
///     .with_in_argument("Step", ArgumentBinding::Literal(json!(1)))
///     .with_result()
///     .with_callback("on_tick");
///
/// assert!(metadata.has_result());
/// assert!(metadata.has_callback("on_tick"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetadata {
    display_name: String,
    arguments: Vec<ArgumentSpec>,
    variables: Vec<VariableSpec>,
    children: Vec<ActivityId>,
    callbacks: Vec<String>,
    fast_path: bool,
}

impl ActivityMetadata {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            arguments: Vec::new(),
            variables: Vec::new(),
            children: Vec::new(),
            callbacks: Vec::new(),
            fast_path: false,
        }
    }

    pub fn with_argument(
        mut self,
        name: impl Into<String>,
        direction: ArgumentDirection,
        binding: ArgumentBinding,
    ) -> Self {
        self.arguments.push(ArgumentSpec {
            name: name.into(),
            direction,
            binding,
        });
        self
    }

    pub fn with_in_argument(self, name: impl Into<String>, binding: ArgumentBinding) -> Self {
        self.with_argument(name, ArgumentDirection::In, binding)
    }

    pub fn with_out_argument(self, name: impl Into<String>, binding: ArgumentBinding) -> Self {
        self.with_argument(name, ArgumentDirection::Out, binding)
    }

    pub fn with_in_out_argument(self, name: impl Into<String>, binding: ArgumentBinding) -> Self {
        self.with_argument(name, ArgumentDirection::InOut, binding)
    }

    /// Declares the unbound `Result` Out argument.
    pub fn with_result(self) -> Self {
        self.with_out_argument(RESULT_ARGUMENT, ArgumentBinding::None)
    }

    /// Declares the `Result` Out argument, copied into `variable` on close.
    pub fn with_result_to(self, variable: impl Into<String>) -> Self {
        self.with_out_argument(RESULT_ARGUMENT, ArgumentBinding::Variable(variable.into()))
    }

    pub fn with_variable(mut self, name: impl Into<String>, default: Value) -> Self {
        self.variables.push(VariableSpec {
            name: name.into(),
            default,
        });
        self
    }

    pub fn with_child(mut self, child: ActivityId) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = ActivityId>) -> Self {
        self.children.extend(children);
        self
    }

    /// Registers a handler name that callbacks may target after a restore.
    pub fn with_callback(mut self, handler: impl Into<String>) -> Self {
        self.callbacks.push(handler.into());
        self
    }

    /// Marks the activity as an expression that can be evaluated inline
    /// through [`Activity::evaluate`].
    pub fn with_fast_path(mut self) -> Self {
        self.fast_path = true;
        self
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn arguments(&self) -> &[ArgumentSpec] {
        &self.arguments
    }

    pub fn argument(&self, name: &str) -> Option<&ArgumentSpec> {
        self.arguments.iter().find(|a| a.name == name)
    }

    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    /// Children declared in the tree, including expression activities
    /// bound to arguments.
    pub fn children(&self) -> &[ActivityId] {
        &self.children
    }

    pub fn callbacks(&self) -> &[String] {
        &self.callbacks
    }

    pub fn has_callback(&self, handler: &str) -> bool {
        self.callbacks.iter().any(|c| c == handler)
    }

    pub fn is_fast_path(&self) -> bool {
        self.fast_path
    }

    pub fn has_result(&self) -> bool {
        self.arguments
            .iter()
            .any(|a| a.name == RESULT_ARGUMENT && a.direction.is_output())
    }

    /// Expression activities referenced by argument bindings.
    pub(crate) fn expression_children(&self) -> impl Iterator<Item = ActivityId> + '_ {
        self.arguments.iter().filter_map(|a| match a.binding {
            ArgumentBinding::Expression(id) => Some(id),
            _ => None,
        })
    }
}

/// An authored unit of workflow logic.
///
/// Only [`metadata`](Activity::metadata) and [`execute`](Activity::execute)
/// are required. Returning `Err` from any entry point raises the fault on the
/// current instance: it is aborted and the fault travels up the tree looking
/// for a handler. Fatal faults (see [`WorkflowFault::is_fatal`]) abort the
/// whole workflow instead.
pub trait Activity: Send + Sync + 'static {
    fn metadata(&self) -> ActivityMetadata;

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault>;

    /// Called once when cancellation of a started instance is requested.
    ///
    /// The default cancels every child and, once only bookmarks remain,
    /// removes them and marks the instance canceled.
    fn cancel(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.cancel_default();
        Ok(())
    }

    /// Called when the instance is torn down by an abort or terminate.
    fn abort(&self, _ctx: &AbortContext<'_>) {}

    /// Dispatches a completion, fault or bookmark callback by handler name.
    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        handler: &str,
        _args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        Err(WorkflowFault::invalid_operation(format!(
            "activity does not handle callback '{handler}'"
        )))
    }

    /// Inline evaluation for activities marked with
    /// [`ActivityMetadata::with_fast_path`].
    fn evaluate(&self, _ctx: &ResolutionContext<'_>) -> Result<Value, WorkflowFault> {
        Err(WorkflowFault::invalid_operation(
            "activity cannot be evaluated inline",
        ))
    }

    /// Stable type name folded into the definition hash.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
