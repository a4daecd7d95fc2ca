//! Canonical `.editloop/` paths and the `init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EditloopConfig, write_config};

/// All canonical paths within `.editloop/` for a project root.
#[derive(Debug, Clone)]
pub struct EditloopPaths {
    pub root: PathBuf,
    pub editloop_dir: PathBuf,
    pub turns_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
}

impl EditloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let editloop_dir = root.join(".editloop");
        Self {
            root: root.clone(),
            editloop_dir: editloop_dir.clone(),
            turns_dir: editloop_dir.join("turns"),
            gitignore_path: editloop_dir.join(".gitignore"),
            config_path: editloop_dir.join("config.toml"),
        }
    }

    pub fn turn_record_path(&self, turn_id: &str) -> PathBuf {
        self.turns_dir.join(format!("{turn_id}.json"))
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing `.editloop/config.toml`.
    pub force: bool,
}

/// Create `.editloop/` scaffolding in `root`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_editloop(root: &Path, options: &InitOptions) -> Result<EditloopPaths> {
    let paths = EditloopPaths::new(root);
    if paths.editloop_dir.exists() && !paths.editloop_dir.is_dir() {
        return Err(anyhow!(
            "editloop init: .editloop exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "editloop init: .editloop/config.toml already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.turns_dir)
        .with_context(|| format!("create directory {}", paths.turns_dir.display()))?;
    fs::write(&paths.gitignore_path, EDITLOOP_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EditloopConfig::default())?;

    Ok(paths)
}

const EDITLOOP_GITIGNORE: &str = "turns/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_editloop(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.turns_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            EDITLOOP_GITIGNORE
        );
        let cfg = load_config(&paths.config_path).expect("load");
        assert_eq!(cfg, EditloopConfig::default());
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_editloop(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_editloop(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_editloop(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "max_attempts = 9\n").expect("write");

        init_editloop(temp.path(), &InitOptions { force: true }).expect("re-init");
        let cfg = load_config(&paths.config_path).expect("load");
        assert_eq!(cfg.max_attempts, 3);
    }
}
