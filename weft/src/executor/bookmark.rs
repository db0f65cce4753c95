//! Bookmarks: named resumption points.
//!
//! An instance that wants to wait for outside input creates a [`Bookmark`]
//! and returns from `execute`. It stays `Executing` while the bookmark is
//! outstanding. Resuming the bookmark schedules the registered callback.
//!
//! The [`BookmarkManager`] owns the bookmarks of one scope. Bookmarks created
//! without a scope live in the executor's own manager; scoped ones live in the
//! [`BookmarkScopeManager`](super::bookmark_scope::BookmarkScopeManager).

use super::bookmark_scope::BookmarkScope;
use super::callback::BookmarkCallback;
use super::instance::InstanceId;
use crate::core::WorkflowFault;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// An opaque resumption token.
///
/// Named bookmarks are addressable by the host. Internal bookmarks carry a
/// numeric id instead and are only resumed by the engine. Equality compares
/// the name (or id) only; the scope travels along for lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<BookmarkScope>,
}

impl Bookmark {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            id: 0,
            scope: None,
        }
    }

    pub(crate) fn internal(id: u64) -> Self {
        Self {
            name: None,
            id,
            scope: None,
        }
    }

    /// Attaches `scope`, so that resuming this value targets that scope.
    pub fn with_scope(mut self, scope: BookmarkScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn scope(&self) -> Option<&BookmarkScope> {
        self.scope.as_ref()
    }

    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }

    pub(crate) fn set_scope(&mut self, scope: Option<BookmarkScope>) {
        self.scope = scope;
    }
}

impl PartialEq for Bookmark {
    fn eq(&self, other: &Self) -> bool {
        match (&self.name, &other.name) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.id == other.id,
            _ => false,
        }
    }
}

impl Eq for Bookmark {}

impl Hash for Bookmark {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.name {
            Some(name) => name.hash(state),
            None => self.id.hash(state),
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "#{}", self.id),
        }
    }
}

/// Resumption behaviour of a bookmark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookmarkOptions {
    multiple_resume: bool,
    non_blocking: bool,
}

impl BookmarkOptions {
    /// Single resume, blocking.
    pub const NONE: BookmarkOptions = BookmarkOptions {
        multiple_resume: false,
        non_blocking: false,
    };

    /// The bookmark stays registered after each resumption.
    pub fn multiple_resume(mut self) -> Self {
        self.multiple_resume = true;
        self
    }

    /// The bookmark does not keep its owner from completing. It is removed
    /// when the owner completes.
    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    pub fn is_multiple_resume(&self) -> bool {
        self.multiple_resume
    }

    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }
}

/// Outcome of a resumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookmarkResumptionResult {
    /// A work item was scheduled.
    Success,
    /// No such bookmark in any scope that was searched.
    NotFound,
    /// The bookmark exists but cannot fire yet. Try again later.
    NotReady,
}

impl BookmarkResumptionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookmarkResumptionResult::Success => "success",
            BookmarkResumptionResult::NotFound => "not found",
            BookmarkResumptionResult::NotReady => "not ready",
        }
    }
}

impl fmt::Display for BookmarkResumptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-facing description of an outstanding named bookmark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkInfo {
    pub name: String,
    pub owner: InstanceId,
    pub owner_display_name: String,
    pub scope: Option<BookmarkScope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BookmarkRecord {
    pub(crate) bookmark: Bookmark,
    pub(crate) callback: Option<BookmarkCallback>,
    pub(crate) owner: InstanceId,
    pub(crate) options: BookmarkOptions,
}

impl BookmarkRecord {
    pub(crate) fn is_blocking(&self) -> bool {
        !self.options.is_non_blocking()
    }
}

/// A bookmark that was selected for resumption.
#[derive(Debug)]
pub(crate) struct ResumedBookmark {
    pub(crate) record: BookmarkRecord,
    /// False for multiple-resume bookmarks, which stay registered.
    pub(crate) removed: bool,
}

#[derive(Debug)]
pub(crate) enum Resumption {
    Ready(ResumedBookmark),
    NotReady,
    NotFound,
}

/// Registry of the bookmarks of one scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookmarkManager {
    records: Vec<BookmarkRecord>,
}

impl BookmarkManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, record: BookmarkRecord) -> Result<(), WorkflowFault> {
        if self.contains(&record.bookmark) {
            return Err(WorkflowFault::invalid_operation(format!(
                "bookmark '{}' already exists",
                record.bookmark
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn contains(&self, bookmark: &Bookmark) -> bool {
        self.records.iter().any(|r| &r.bookmark == bookmark)
    }

    pub(crate) fn remove(&mut self, bookmark: &Bookmark) -> Option<BookmarkRecord> {
        let index = self.records.iter().position(|r| &r.bookmark == bookmark)?;
        Some(self.records.remove(index))
    }

    pub(crate) fn remove_owned_by(&mut self, owner: InstanceId) -> Vec<BookmarkRecord> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| r.owner == owner);
        self.records = kept;
        removed
    }

    /// Selects `bookmark` for resumption. Single-resume bookmarks are removed.
    pub(crate) fn take_for_resumption(
        &mut self,
        bookmark: &Bookmark,
        handles: &ExclusiveHandles,
    ) -> Resumption {
        let Some(index) = self.records.iter().position(|r| &r.bookmark == bookmark) else {
            return Resumption::NotFound;
        };
        if handles.is_unstable(&self.records[index].bookmark) {
            return Resumption::NotReady;
        }
        if self.records[index].options.is_multiple_resume() {
            Resumption::Ready(ResumedBookmark {
                record: self.records[index].clone(),
                removed: false,
            })
        } else {
            Resumption::Ready(ResumedBookmark {
                record: self.records.remove(index),
                removed: true,
            })
        }
    }

    pub(crate) fn records(&self) -> &[BookmarkRecord] {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut BookmarkRecord> {
        self.records.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn remove_all_records(&mut self) -> Vec<BookmarkRecord> {
        std::mem::take(&mut self.records)
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

/// Identifies an exclusive handle created by an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusiveHandleId(u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExclusiveHandle {
    id: ExclusiveHandleId,
    owner: InstanceId,
    important: Vec<Bookmark>,
    unimportant: Vec<Bookmark>,
}

/// Exclusive handles group bookmarks so that an important bookmark only
/// fires once every unimportant bookmark of its handle is gone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ExclusiveHandles {
    next_id: u64,
    handles: Vec<ExclusiveHandle>,
}

impl ExclusiveHandles {
    pub(crate) fn create(&mut self, owner: InstanceId) -> ExclusiveHandleId {
        self.next_id += 1;
        let id = ExclusiveHandleId(self.next_id);
        self.handles.push(ExclusiveHandle {
            id,
            owner,
            important: Vec::new(),
            unimportant: Vec::new(),
        });
        id
    }

    /// Returns false if the handle does not exist.
    pub(crate) fn add(&mut self, id: ExclusiveHandleId, bookmark: Bookmark, important: bool) -> bool {
        let Some(handle) = self.handles.iter_mut().find(|h| h.id == id) else {
            return false;
        };
        if important {
            handle.important.push(bookmark);
        } else {
            handle.unimportant.push(bookmark);
        }
        true
    }

    pub(crate) fn is_unstable(&self, bookmark: &Bookmark) -> bool {
        self.handles
            .iter()
            .any(|h| !h.unimportant.is_empty() && h.important.contains(bookmark))
    }

    pub(crate) fn remove_bookmark(&mut self, bookmark: &Bookmark) {
        for handle in &mut self.handles {
            handle.important.retain(|b| b != bookmark);
            handle.unimportant.retain(|b| b != bookmark);
        }
    }

    pub(crate) fn remove_owned_by(&mut self, owner: InstanceId) {
        self.handles.retain(|h| h.owner != owner);
    }

    pub(crate) fn clear(&mut self) {
        self.handles.clear();
    }
}
