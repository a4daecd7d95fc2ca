//! Materialize base + overlay into a throwaway directory for the typechecker.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::path::{ProjectPath, normalize};

/// A materialized copy of the project. Removed on drop.
#[derive(Debug)]
pub struct StagedTree {
    dir: TempDir,
    pub copied: usize,
    pub written: usize,
}

impl StagedTree {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn resolve(&self, path: &ProjectPath) -> PathBuf {
        self.dir.path().join(path.as_str())
    }
}

pub struct StageRequest<'a> {
    pub root: &'a Path,
    pub writes: &'a BTreeMap<ProjectPath, String>,
    pub deletes: &'a BTreeSet<ProjectPath>,
    /// Top-level directory names left out of the copy.
    pub skip_dirs: &'a [String],
}

/// Copy the base tree minus deletes, then lay overlay writes on top.
///
/// A skipped `node_modules` is symlinked back to the project on Unix so module
/// resolution still works inside the staged tree.
#[instrument(skip_all, fields(root = %request.root.display(), writes = request.writes.len(), deletes = request.deletes.len()))]
pub fn stage_tree(request: &StageRequest<'_>) -> Result<StagedTree> {
    let dir = tempfile::Builder::new()
        .prefix("editloop-stage-")
        .tempdir()
        .context("create staging directory")?;
    let mut staged = StagedTree {
        dir,
        copied: 0,
        written: 0,
    };

    let walker = WalkDir::new(request.root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || !request
                    .skip_dirs
                    .iter()
                    .any(|skip| entry.file_name().to_str() == Some(skip.as_str()))
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", request.root.display()))?;
        let relative = entry
            .path()
            .strip_prefix(request.root)
            .with_context(|| format!("strip root from {}", entry.path().display()))?;
        let target = staged.path().join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create directory {}", target.display()))?;
            continue;
        }
        let Some(project_path) = relative.to_str().and_then(|raw| normalize(raw).ok()) else {
            warn!(path = %relative.display(), "skipping unrepresentable path");
            continue;
        };
        if request.deletes.contains(&project_path) || request.writes.contains_key(&project_path)
        {
            continue;
        }
        if let Err(err) = fs::copy(entry.path(), &target) {
            warn!(path = %project_path, err = %err, "skipping uncopyable file");
            continue;
        }
        staged.copied += 1;
    }

    for (path, content) in request.writes {
        let target = staged.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&target, content).with_context(|| format!("write {}", target.display()))?;
        staged.written += 1;
    }

    link_node_modules(request, staged.path())?;
    debug!(copied = staged.copied, written = staged.written, "staged tree");
    Ok(staged)
}

#[cfg(unix)]
fn link_node_modules(request: &StageRequest<'_>, staged: &Path) -> Result<()> {
    let source = request.root.join("node_modules");
    let target = staged.join("node_modules");
    if source.is_dir() && !target.exists() {
        std::os::unix::fs::symlink(&source, &target)
            .with_context(|| format!("link {}", target.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn link_node_modules(_request: &StageRequest<'_>, _staged: &Path) -> Result<()> {
    Ok(())
}
