//! Filesystem-backed base tree.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::overlay::BaseTree;
use crate::core::path::ProjectPath;

/// Read-only view of the project directory on disk.
#[derive(Debug, Clone)]
pub struct FsBaseTree {
    root: PathBuf,
}

impl FsBaseTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &ProjectPath) -> PathBuf {
        self.root.join(path.as_str())
    }
}

impl BaseTree for FsBaseTree {
    fn read(&self, path: &ProjectPath) -> Option<String> {
        let full = self.resolve(path);
        match fs::read_to_string(&full) {
            Ok(content) => Some(content),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path, err = %err, "unreadable base file treated as absent");
                None
            }
        }
    }

    fn exists(&self, path: &ProjectPath) -> bool {
        self.resolve(path).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::path::normalize;

    #[test]
    fn reads_files_under_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/a.ts"), "export {}\n").expect("write");

        let tree = FsBaseTree::new(temp.path());
        let path = normalize("src/a.ts").unwrap();
        assert!(tree.exists(&path));
        assert_eq!(tree.read(&path).as_deref(), Some("export {}\n"));
        assert!(!tree.exists(&normalize("src").unwrap()));
        assert_eq!(tree.read(&normalize("missing.ts").unwrap()), None);
    }
}
