//! Temp-file-then-rename writes.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tempfile::NamedTempFile;
use tracing::warn;

/// Atomically replace `path` with `contents`, creating parent directories.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut created = Vec::new();
    let staged = stage_file(path, contents, &mut created)?;
    persist(staged, path)
}

/// Write `contents` to a temp file beside `path` without touching `path`.
///
/// Missing parent directories are created and recorded in `created`,
/// outermost first, so a caller can undo them.
pub(crate) fn stage_file(
    path: &Path,
    contents: &str,
    created: &mut Vec<PathBuf>,
) -> Result<NamedTempFile> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    create_dirs(parent, created)?;
    if path.is_dir() {
        bail!("cannot replace directory {}", path.display());
    }
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp file for {}", path.display()))?;
    Ok(tmp)
}

/// Rename a staged temp file over its target.
pub(crate) fn persist(staged: NamedTempFile, path: &Path) -> Result<()> {
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Remove directories recorded by [`stage_file`], innermost first.
pub(crate) fn remove_created_dirs(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(err) = fs::remove_dir(dir)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(dir = %dir.display(), %err, "failed to remove staged directory");
        }
    }
}

fn create_dirs(dir: &Path, created: &mut Vec<PathBuf>) -> Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(current) = cursor {
        if current.as_os_str().is_empty() || current.exists() {
            break;
        }
        missing.push(current.to_path_buf());
        cursor = current.parent();
    }
    for dir in missing.into_iter().rev() {
        fs::create_dir(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        created.push(dir);
    }
    if !dir.as_os_str().is_empty() && !dir.is_dir() {
        bail!("{} exists and is not a directory", dir.display());
    }
    Ok(())
}
