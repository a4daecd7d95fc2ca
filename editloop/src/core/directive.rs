//! Parsed edit directives and the issues raised while handling them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::error::{ApplyError, PathError};
use crate::core::path::ProjectPath;

/// One structural edit instruction extracted from agent output.
///
/// Immutable once parsed; identity is the variant plus its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    Write {
        path: ProjectPath,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Rename {
        from: ProjectPath,
        to: ProjectPath,
    },
    Delete {
        path: ProjectPath,
    },
    AddDependency {
        packages: BTreeSet<String>,
    },
}

impl Directive {
    pub fn kind(&self) -> DirectiveKind {
        match self {
            Directive::Write { .. } => DirectiveKind::Write,
            Directive::Rename { .. } => DirectiveKind::Rename,
            Directive::Delete { .. } => DirectiveKind::Delete,
            Directive::AddDependency { .. } => DirectiveKind::AddDependency,
        }
    }

    /// Short human-readable label for logs and prompts.
    pub fn label(&self) -> String {
        match self {
            Directive::Write { path, .. } => format!("write {path}"),
            Directive::Rename { from, to } => format!("rename {from} -> {to}"),
            Directive::Delete { path } => format!("delete {path}"),
            Directive::AddDependency { packages } => {
                let list: Vec<&str> = packages.iter().map(String::as_str).collect();
                format!("add-dependency {}", list.join(" "))
            }
        }
    }
}

/// Directive variant without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    Write,
    Rename,
    Delete,
    AddDependency,
}

impl DirectiveKind {
    /// Tag name suffix as it appears after `edit-`.
    pub fn tag_name(self) -> &'static str {
        match self {
            DirectiveKind::Write => "write",
            DirectiveKind::Rename => "rename",
            DirectiveKind::Delete => "delete",
            DirectiveKind::AddDependency => "add-dependency",
        }
    }

    pub fn from_tag_name(name: &str) -> Option<Self> {
        match name {
            "write" => Some(DirectiveKind::Write),
            "rename" => Some(DirectiveKind::Rename),
            "delete" => Some(DirectiveKind::Delete),
            "add-dependency" => Some(DirectiveKind::AddDependency),
            _ => None,
        }
    }
}

/// Byte range of a directive within one generated stream of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceSpan {
    /// Zero-based index of the generation stream within the turn.
    pub stream: u32,
    pub start: usize,
    pub end: usize,
}

/// A closed directive together with the text span it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpannedDirective {
    #[serde(flatten)]
    pub directive: Directive,
    pub span: SourceSpan,
}

/// Category of a per-directive problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A path resolved outside the project root; the directive was skipped.
    PathEscape,
    /// A path was empty or otherwise unusable; the directive was skipped.
    InvalidPath,
    /// A tag was never closed, used an unknown name, or lacked attributes.
    MalformedDirective,
    /// A rename source existed in neither the overlay nor the base tree.
    SourceNotFound,
}

/// A per-directive error collected on the turn result instead of aborting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveIssue {
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SourceSpan>,
    pub message: String,
}

impl DirectiveIssue {
    pub fn malformed(span: SourceSpan, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::MalformedDirective,
            span: Some(span),
            message: message.into(),
        }
    }

    pub fn from_path_error(span: SourceSpan, err: &PathError) -> Self {
        let kind = match err {
            PathError::Escape { .. } => IssueKind::PathEscape,
            PathError::Empty { .. } | PathError::Invalid { .. } => IssueKind::InvalidPath,
        };
        Self {
            kind,
            span: Some(span),
            message: err.to_string(),
        }
    }

    pub fn from_apply_error(span: SourceSpan, err: &ApplyError) -> Self {
        let kind = match err {
            ApplyError::SourceNotFound { .. } => IssueKind::SourceNotFound,
        };
        Self {
            kind,
            span: Some(span),
            message: err.to_string(),
        }
    }
}
