//! Layered virtual filesystem: a read-only base tree plus pending mutations.
//!
//! The overlay never touches the base tree. Reads resolve overlay first, and a
//! path marked deleted is absent regardless of what the base tree holds.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::path::ProjectPath;

/// Read-only view of the canonical project tree.
pub trait BaseTree {
    /// Content of `path`, or `None` if the base tree has no such file.
    fn read(&self, path: &ProjectPath) -> Option<String>;

    fn exists(&self, path: &ProjectPath) -> bool {
        self.read(path).is_some()
    }
}

/// In-memory base tree for dry runs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTree {
    files: BTreeMap<ProjectPath, String>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: ProjectPath, content: impl Into<String>) -> Self {
        self.files.insert(path, content.into());
        self
    }

    pub fn insert(&mut self, path: ProjectPath, content: impl Into<String>) {
        self.files.insert(path, content.into());
    }

    pub fn files(&self) -> &BTreeMap<ProjectPath, String> {
        &self.files
    }
}

impl BaseTree for MemoryTree {
    fn read(&self, path: &ProjectPath) -> Option<String> {
        self.files.get(path).cloned()
    }

    fn exists(&self, path: &ProjectPath) -> bool {
        self.files.contains_key(path)
    }
}

/// Pending, uncommitted mutations for one turn.
///
/// Invariant after every applier pass: no path is both a key of `writes` and a
/// member of `deletes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayStore {
    pub(crate) writes: BTreeMap<ProjectPath, String>,
    pub(crate) deletes: BTreeSet<ProjectPath>,
    pub(crate) renames: BTreeMap<ProjectPath, ProjectPath>,
    pub(crate) closed_writes: BTreeSet<ProjectPath>,
    pub(crate) dependencies: BTreeSet<String>,
}

/// Point-in-time copy of the overlay for preview and commit collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySnapshot {
    pub files: BTreeMap<ProjectPath, String>,
    pub deleted: BTreeSet<ProjectPath>,
    pub dependencies: BTreeSet<String>,
}

impl OverlayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> &BTreeMap<ProjectPath, String> {
        &self.writes
    }

    pub fn deletes(&self) -> &BTreeSet<ProjectPath> {
        &self.deletes
    }

    /// Effective renames as `from -> to`, with chains collapsed.
    pub fn renames(&self) -> &BTreeMap<ProjectPath, ProjectPath> {
        &self.renames
    }

    /// Paths whose write directive closed during the current turn.
    pub fn closed_writes(&self) -> &BTreeSet<ProjectPath> {
        &self.closed_writes
    }

    /// Union of every package requested by add-dependency directives.
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
            && self.deletes.is_empty()
            && self.renames.is_empty()
            && self.dependencies.is_empty()
    }

    pub fn file_exists<B: BaseTree + ?Sized>(&self, base: &B, path: &ProjectPath) -> bool {
        if self.writes.contains_key(path) {
            return true;
        }
        if self.deletes.contains(path) {
            return false;
        }
        base.exists(path)
    }

    pub fn read_file<B: BaseTree + ?Sized>(&self, base: &B, path: &ProjectPath) -> Option<String> {
        if let Some(content) = self.writes.get(path) {
            return Some(content.clone());
        }
        if self.deletes.contains(path) {
            return None;
        }
        base.read(path)
    }

    /// Virtual files (path -> content) pending in the overlay.
    pub fn virtual_files(&self) -> BTreeMap<ProjectPath, String> {
        self.writes.clone()
    }

    /// Paths removed by the overlay, including rename sources.
    pub fn deleted_files(&self) -> BTreeSet<ProjectPath> {
        self.deletes.clone()
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        OverlaySnapshot {
            files: self.virtual_files(),
            deleted: self.deleted_files(),
            dependencies: self.dependencies.clone(),
        }
    }

    /// Drop every pending mutation.
    pub fn discard(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn holds_consistent_state(&self) -> bool {
        self.writes.keys().all(|path| !self.deletes.contains(path))
    }
}
