//! Bookmark scopes.
//!
//! A scope partitions bookmarks by correlation, so that two conversations
//! can each wait on a bookmark called `"reply"`. Scopes come in three forms:
//!
//! - the well-known default scope,
//! - initialized scopes, keyed by a correlation [`Uuid`],
//! - uninitialized scopes, created by an activity before the correlation id
//!   is known and identified by a temporary number until promoted.
//!
//! Resuming into an initialized scope that does not hold the bookmark falls
//! back to the uninitialized scopes. A hit there promotes that scope to the
//! requested id.

use super::bookmark::{Bookmark, BookmarkManager, BookmarkRecord, ExclusiveHandles, Resumption};
use super::instance::InstanceId;
use crate::core::WorkflowFault;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookmarkScope {
    Default,
    Initialized(Uuid),
    Uninitialized(u64),
}

impl BookmarkScope {
    pub fn new(id: Uuid) -> Self {
        BookmarkScope::Initialized(id)
    }

    pub fn is_default(&self) -> bool {
        matches!(self, BookmarkScope::Default)
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self, BookmarkScope::Uninitialized(_))
    }

    /// The correlation id of an initialized scope.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            BookmarkScope::Initialized(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookmarkScope::Default => f.write_str("default"),
            BookmarkScope::Initialized(id) => write!(f, "{id}"),
            BookmarkScope::Uninitialized(temp) => write!(f, "uninitialized#{temp}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopeEntry {
    scope: BookmarkScope,
    /// The instance whose completion unregisters this scope. None for the default scope.
    owner: Option<InstanceId>,
    bookmarks: BookmarkManager,
}

/// What a resumption attempt against the scopes produced.
#[derive(Debug)]
pub(crate) struct ScopedResumption {
    pub(crate) resumption: Resumption,
    /// Set when an uninitialized scope was promoted to satisfy the request.
    pub(crate) promoted: Option<Uuid>,
}

/// Bookmarks removed along with a scope, plus the correlation ids the host
/// should forget.
#[derive(Debug, Default)]
pub(crate) struct UnregisteredScopes {
    pub(crate) bookmarks: Vec<BookmarkRecord>,
    pub(crate) disassociated: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookmarkScopeManager {
    scopes: Vec<ScopeEntry>,
    next_temporary_id: u64,
}

impl BookmarkScopeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, scope: &BookmarkScope) -> Option<&ScopeEntry> {
        self.scopes.iter().find(|e| &e.scope == scope)
    }

    fn entry_mut(&mut self, scope: &BookmarkScope) -> Option<&mut ScopeEntry> {
        self.scopes.iter_mut().find(|e| &e.scope == scope)
    }

    /// Creates a scope that waits for its correlation id.
    pub(crate) fn create_uninitialized(&mut self, owner: InstanceId) -> BookmarkScope {
        self.next_temporary_id += 1;
        let scope = BookmarkScope::Uninitialized(self.next_temporary_id);
        self.scopes.push(ScopeEntry {
            scope: scope.clone(),
            owner: Some(owner),
            bookmarks: BookmarkManager::new(),
        });
        scope
    }

    /// Registers an initialized scope owned by `owner`.
    pub(crate) fn register(&mut self, id: Uuid, owner: InstanceId) -> Result<BookmarkScope, WorkflowFault> {
        let scope = BookmarkScope::Initialized(id);
        if self.entry(&scope).is_some() {
            return Err(WorkflowFault::invalid_operation(format!(
                "bookmark scope {id} is already registered"
            )));
        }
        self.scopes.push(ScopeEntry {
            scope: scope.clone(),
            owner: Some(owner),
            bookmarks: BookmarkManager::new(),
        });
        Ok(scope)
    }

    /// Promotes an uninitialized scope to `id`.
    pub(crate) fn initialize(
        &mut self,
        scope: &BookmarkScope,
        id: Uuid,
    ) -> Result<BookmarkScope, WorkflowFault> {
        if scope.is_initialized() {
            return Err(WorkflowFault::invalid_operation(format!(
                "bookmark scope {scope} is already initialized"
            )));
        }
        let target = BookmarkScope::Initialized(id);
        if self.entry(&target).is_some() {
            return Err(WorkflowFault::invalid_operation(format!(
                "bookmark scope {id} is already registered"
            )));
        }
        let Some(entry) = self.entry_mut(scope) else {
            return Err(WorkflowFault::invalid_operation(format!(
                "bookmark scope {scope} is not registered"
            )));
        };
        entry.scope = target.clone();
        for record in entry.bookmarks.records_mut() {
            record.bookmark.set_scope(Some(target.clone()));
        }
        Ok(target)
    }

    pub(crate) fn add_bookmark(
        &mut self,
        scope: &BookmarkScope,
        mut record: BookmarkRecord,
    ) -> Result<(), WorkflowFault> {
        if scope.is_default() && self.entry(scope).is_none() {
            self.scopes.push(ScopeEntry {
                scope: BookmarkScope::Default,
                owner: None,
                bookmarks: BookmarkManager::new(),
            });
        }
        let Some(entry) = self.entry_mut(scope) else {
            return Err(WorkflowFault::invalid_operation(format!(
                "bookmark scope {scope} is not registered"
            )));
        };
        record.bookmark.set_scope(Some(scope.clone()));
        entry.bookmarks.add(record)
    }

    pub(crate) fn remove_bookmark(
        &mut self,
        bookmark: &Bookmark,
        scope: &BookmarkScope,
    ) -> Option<BookmarkRecord> {
        self.entry_mut(scope)?.bookmarks.remove(bookmark)
    }

    /// Removes every bookmark owned by `owner`, in any scope.
    pub(crate) fn remove_owned_by(&mut self, owner: InstanceId) -> Vec<BookmarkRecord> {
        self.scopes
            .iter_mut()
            .flat_map(|e| e.bookmarks.remove_owned_by(owner))
            .collect()
    }

    /// Drops the scopes `owner` created.
    pub(crate) fn unregister_owned_by(&mut self, owner: InstanceId) -> UnregisteredScopes {
        let mut out = UnregisteredScopes::default();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scopes)
            .into_iter()
            .partition(|e| e.owner == Some(owner));
        self.scopes = kept;
        for mut entry in removed {
            if let Some(id) = entry.scope.id() {
                out.disassociated.push(id);
            }
            out.bookmarks
                .extend(entry.bookmarks.remove_all_records());
        }
        out
    }

    pub(crate) fn take_for_resumption(
        &mut self,
        bookmark: &Bookmark,
        scope: &BookmarkScope,
        handles: &ExclusiveHandles,
    ) -> ScopedResumption {
        if let Some(entry) = self.entry_mut(scope) {
            if entry.bookmarks.contains(bookmark) {
                return ScopedResumption {
                    resumption: entry.bookmarks.take_for_resumption(bookmark, handles),
                    promoted: None,
                };
            }
        }

        let Some(id) = scope.id() else {
            return ScopedResumption {
                resumption: Resumption::NotFound,
                promoted: None,
            };
        };
        if self.entry(scope).is_some() {
            // The named scope exists; only its own bookmarks may answer.
            return ScopedResumption {
                resumption: Resumption::NotFound,
                promoted: None,
            };
        }

        let candidate = self
            .scopes
            .iter_mut()
            .find(|e| !e.scope.is_initialized() && e.bookmarks.contains(bookmark));
        let Some(entry) = candidate else {
            return ScopedResumption {
                resumption: Resumption::NotFound,
                promoted: None,
            };
        };

        let resumption = entry.bookmarks.take_for_resumption(bookmark, handles);
        if matches!(resumption, Resumption::NotReady) {
            return ScopedResumption {
                resumption,
                promoted: None,
            };
        }

        entry.scope = scope.clone();
        for record in entry.bookmarks.records_mut() {
            record.bookmark.set_scope(Some(scope.clone()));
        }
        let resumption = match resumption {
            Resumption::Ready(mut resumed) => {
                resumed.record.bookmark.set_scope(Some(scope.clone()));
                Resumption::Ready(resumed)
            }
            other => other,
        };
        ScopedResumption {
            resumption,
            promoted: Some(id),
        }
    }

    /// Every bookmark record together with its scope.
    pub(crate) fn records(&self) -> impl Iterator<Item = &BookmarkRecord> {
        self.scopes.iter().flat_map(|e| e.bookmarks.records().iter())
    }

    pub(crate) fn records_in(&self, scope: &BookmarkScope) -> &[BookmarkRecord] {
        match self.entry(scope) {
            Some(entry) => entry.bookmarks.records(),
            None => &[],
        }
    }

    pub fn contains_scope(&self, scope: &BookmarkScope) -> bool {
        self.entry(scope).is_some()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.scopes.clear();
    }
}
