//! Path guard: normalizes project-relative paths and rejects root escapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::PathError;

/// A normalized, project-relative, `/`-separated path.
///
/// Construct through [`normalize`] (or `TryFrom<String>`); a value of this type
/// never contains `.`/`..` segments, empty segments, or a leading slash.
/// Identity is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectPath(String);

impl ProjectPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProjectPath {
    type Error = PathError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        normalize(&raw)
    }
}

impl TryFrom<&str> for ProjectPath {
    type Error = PathError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        normalize(raw)
    }
}

impl From<ProjectPath> for String {
    fn from(path: ProjectPath) -> Self {
        path.0
    }
}

/// Normalize a raw path extracted from agent output.
///
/// - `\` is treated as a separator, empty and `.` segments are dropped.
/// - `..` pops the previous segment; popping past the root fails with
///   [`PathError::Escape`].
/// - A leading `/` anchors the path at the project root.
/// - Drive prefixes (`C:`) and NUL bytes are rejected.
pub fn normalize(raw: &str) -> Result<ProjectPath, PathError> {
    let trimmed = raw.trim();
    if trimmed.contains('\0') {
        return Err(PathError::Invalid {
            raw: raw.to_string(),
            reason: "contains NUL byte",
        });
    }
    let unified = trimmed.replace('\\', "/");
    if has_drive_prefix(&unified) {
        return Err(PathError::Invalid {
            raw: raw.to_string(),
            reason: "drive-qualified paths are not project-relative",
        });
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(PathError::Escape {
                        raw: raw.to_string(),
                    });
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(PathError::Empty {
            raw: raw.to_string(),
        });
    }
    Ok(ProjectPath(segments.join("/")))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
