//! Workflow definitions.
//!
//! A [`WorkflowDefinition`] is an immutable arena of activities addressed by
//! [`ActivityId`]. It is built bottom-up: children are added first, and the
//! ids they return are handed to their parents' constructors.
//!
//! # Example
//!
//! ```
//! use weft::definition::{
//!     Activity, ActivityMetadata, DefinitionBuilder, WorkflowIdentity,
//! };
//! use weft::executor::ActivityContext;
//! use weft::WorkflowFault;
//!
//! struct Noop;
//!
//! impl Activity for Noop {
//!     fn metadata(&self) -> ActivityMetadata {
//!         ActivityMetadata::new("Noop")
//!     }
//!
//!     fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
//!         Ok(())
//!     }
//! }
//!
//! let mut builder = DefinitionBuilder::new(WorkflowIdentity::new("noop", "1"));
//! let root = builder.add(Noop);
//! let definition = builder.build(root).unwrap();
//! assert_eq!(definition.root(), root);
//! assert_eq!(definition.len(), 1);
//! ```

use super::activity::{Activity, ActivityMetadata};
use super::error::{DefinitionError, DefinitionResult};
use super::ActivityId;
use crate::core::{serialize_value, stable_hash};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Name and version of a workflow definition.
///
/// Stored in every snapshot. Restoring against a definition with a different
/// identity is refused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowIdentity {
    name: String,
    version: String,
}

impl WorkflowIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for WorkflowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

struct ActivityEntry {
    activity: Arc<dyn Activity>,
    metadata: ActivityMetadata,
    type_name: &'static str,
    parent: Option<ActivityId>,
}

/// The part of an entry that feeds the structural hash.
#[derive(Serialize)]
struct EntryShape<'a> {
    type_name: &'a str,
    metadata: &'a ActivityMetadata,
}

pub struct WorkflowDefinition {
    identity: WorkflowIdentity,
    entries: Vec<ActivityEntry>,
    root: ActivityId,
    hash: u64,
}

impl WorkflowDefinition {
    pub fn identity(&self) -> &WorkflowIdentity {
        &self.identity
    }

    pub fn root(&self) -> ActivityId {
        self.root
    }

    /// Structural fingerprint over every activity's type and metadata.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ActivityId) -> bool {
        id.index() < self.entries.len()
    }

    pub fn activity(&self, id: ActivityId) -> Option<&Arc<dyn Activity>> {
        self.entries.get(id.index()).map(|e| &e.activity)
    }

    pub fn metadata(&self, id: ActivityId) -> Option<&ActivityMetadata> {
        self.entries.get(id.index()).map(|e| &e.metadata)
    }

    pub fn type_name(&self, id: ActivityId) -> Option<&'static str> {
        self.entries.get(id.index()).map(|e| e.type_name)
    }

    /// The activity that declares `id` as a child, if any.
    pub fn parent(&self, id: ActivityId) -> Option<ActivityId> {
        self.entries.get(id.index()).and_then(|e| e.parent)
    }

    /// Display name, falling back to the id for unknown activities.
    pub fn display_name(&self, id: ActivityId) -> String {
        match self.metadata(id) {
            Some(metadata) => metadata.display_name().to_string(),
            None => format!("activity {id}"),
        }
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("identity", &self.identity)
            .field("activities", &self.entries.len())
            .field("root", &self.root)
            .field("hash", &format_args!("{:#018x}", self.hash))
            .finish()
    }
}

/// Collects activities and validates them into a [`WorkflowDefinition`].
pub struct DefinitionBuilder {
    identity: WorkflowIdentity,
    entries: Vec<ActivityEntry>,
}

impl DefinitionBuilder {
    pub fn new(identity: WorkflowIdentity) -> Self {
        Self {
            identity,
            entries: Vec::new(),
        }
    }

    /// Adds an activity and returns its id. Metadata is read exactly once, here.
    pub fn add<A: Activity>(&mut self, activity: A) -> ActivityId {
        self.add_shared(Arc::new(activity))
    }

    pub fn add_shared(&mut self, activity: Arc<dyn Activity>) -> ActivityId {
        let id = ActivityId::new(self.entries.len());
        let metadata = activity.metadata();
        let type_name = activity.type_name();
        self.entries.push(ActivityEntry {
            activity,
            metadata,
            type_name,
            parent: None,
        });
        id
    }

    /// Validates the tree rooted at `root` and freezes it.
    ///
    /// # Errors
    ///
    /// Fails when an id is dangling, when an activity is declared by two
    /// parents, when something is not reachable from `root`, or when an
    /// activity declares a callback or location name twice.
    pub fn build(mut self, root: ActivityId) -> DefinitionResult<WorkflowDefinition> {
        if self.entries.is_empty() {
            return Err(DefinitionError::EmptyDefinition);
        }
        if root.index() >= self.entries.len() {
            return Err(DefinitionError::activity_not_found(root));
        }

        self.link_parents()?;

        if let Some(parent) = self.entries[root.index()].parent {
            return Err(DefinitionError::RootHasParent { root, parent });
        }

        self.check_reachable(root)?;
        self.check_names()?;

        let shapes: Vec<EntryShape<'_>> = self
            .entries
            .iter()
            .map(|e| EntryShape {
                type_name: e.type_name,
                metadata: &e.metadata,
            })
            .collect();
        let hash = stable_hash(&serialize_value(&(&self.identity, root, shapes))?);

        debug!(
            identity = %self.identity,
            activities = self.entries.len(),
            hash,
            "built workflow definition"
        );

        Ok(WorkflowDefinition {
            identity: self.identity,
            entries: self.entries,
            root,
            hash,
        })
    }

    fn link_parents(&mut self) -> DefinitionResult<()> {
        for index in 0..self.entries.len() {
            let parent = ActivityId::new(index);
            let mut seen = HashSet::new();
            let metadata = &self.entries[index].metadata;
            let edges: Vec<ActivityId> = metadata
                .children()
                .iter()
                .copied()
                .chain(metadata.expression_children())
                .filter(|child| seen.insert(*child))
                .collect();

            for child in edges {
                let Some(entry) = self.entries.get_mut(child.index()) else {
                    return Err(DefinitionError::activity_not_found(child));
                };
                if let Some(first) = entry.parent {
                    return Err(DefinitionError::multiple_parents(child, first, parent));
                }
                entry.parent = Some(parent);
            }
        }
        Ok(())
    }

    fn check_reachable(&self, root: ActivityId) -> DefinitionResult<()> {
        let mut reached = vec![false; self.entries.len()];
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if std::mem::replace(&mut reached[id.index()], true) {
                continue;
            }
            let metadata = &self.entries[id.index()].metadata;
            queue.extend(metadata.children().iter().copied());
            queue.extend(metadata.expression_children());
        }

        match reached.iter().position(|r| !r) {
            Some(index) => Err(DefinitionError::Unreachable {
                id: ActivityId::new(index),
            }),
            None => Ok(()),
        }
    }

    fn check_names(&self) -> DefinitionResult<()> {
        for (index, entry) in self.entries.iter().enumerate() {
            let id = ActivityId::new(index);

            let mut callbacks = HashSet::new();
            for name in entry.metadata.callbacks() {
                if !callbacks.insert(name.as_str()) {
                    return Err(DefinitionError::duplicate_callback(id, name.as_str()));
                }
            }

            let mut locations = HashSet::new();
            let names = entry
                .metadata
                .arguments()
                .iter()
                .map(|a| a.name.as_str())
                .chain(entry.metadata.variables().iter().map(|v| v.name.as_str()));
            for name in names {
                if !locations.insert(name) {
                    return Err(DefinitionError::duplicate_location(id, name));
                }
            }
        }
        Ok(())
    }
}
