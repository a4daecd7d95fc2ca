//! Commit collaborator: flatten an overlay into the project tree on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{info, instrument, warn};

use super::atomic::{persist, remove_created_dirs, stage_file};
use crate::core::overlay::OverlayStore;
use crate::core::path::ProjectPath;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub written: Vec<String>,
    pub removed: Vec<String>,
}

/// Write every virtual file and remove every deleted path under `root`.
///
/// Every write is first staged as a temp file beside its target and every
/// deleted path is checked. A failure while staging leaves the tree as it
/// was. Only then are deletions applied and the staged files renamed into
/// place.
#[instrument(skip_all, fields(root = %root.display(), writes = overlay.writes().len(), deletes = overlay.deletes().len()))]
pub fn commit_overlay(root: &Path, overlay: &OverlayStore) -> Result<CommitSummary> {
    let deleted = overlay.deleted_files();
    let virtual_files = overlay.virtual_files();

    let mut created = Vec::new();
    let staged = match stage_commit(root, &deleted, &virtual_files, &mut created) {
        Ok(staged) => staged,
        Err(err) => {
            remove_created_dirs(&created);
            warn!(error = %format!("{err:#}"), "commit aborted before touching the tree");
            return Err(err);
        }
    };

    let mut summary = CommitSummary::default();
    for path in &deleted {
        let full = root.join(path.as_str());
        match fs::remove_file(&full) {
            Ok(()) => summary.removed.push(path.to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove {}", full.display()));
            }
        }
    }
    for (path, tmp) in staged {
        persist(tmp, &root.join(path.as_str()))?;
        summary.written.push(path);
    }
    info!(
        written = summary.written.len(),
        removed = summary.removed.len(),
        "committed overlay"
    );
    Ok(summary)
}

type StagedWrites = Vec<(String, NamedTempFile)>;

fn stage_commit(
    root: &Path,
    deleted: &BTreeSet<ProjectPath>,
    virtual_files: &BTreeMap<ProjectPath, String>,
    created: &mut Vec<PathBuf>,
) -> Result<StagedWrites> {
    for path in deleted {
        let full = root.join(path.as_str());
        if full.is_dir() {
            bail!("cannot delete directory {}", full.display());
        }
    }
    let mut staged = Vec::with_capacity(virtual_files.len());
    for (path, content) in virtual_files {
        let tmp = stage_file(&root.join(path.as_str()), content, created)?;
        staged.push((path.to_string(), tmp));
    }
    Ok(staged)
}
