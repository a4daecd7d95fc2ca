//! Typed errors raised by the pure core.
//!
//! Per-directive failures never abort a batch; the applier converts them into
//! [`DirectiveIssue`](crate::core::directive::DirectiveIssue) records instead.

use thiserror::Error;

use crate::core::path::ProjectPath;

/// Rejection reasons from [`normalize`](crate::core::path::normalize).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// Resolving `..` segments would leave the project root.
    #[error("path escapes project root: {raw:?}")]
    Escape { raw: String },
    /// The path resolves to the project root itself.
    #[error("path is empty after normalization: {raw:?}")]
    Empty { raw: String },
    /// The path contains characters or prefixes a project file cannot have.
    #[error("invalid path {raw:?}: {reason}")]
    Invalid { raw: String, reason: &'static str },
}

/// Failures applying a single directive to the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("rename source not found: {from}")]
    SourceNotFound { from: ProjectPath },
}

/// Failures of the typecheck collaborator itself, distinct from compile problems.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypecheckError {
    #[error("typecheck collaborator unavailable: {0}")]
    Unavailable(String),
}

/// A state machine edge the controller is not allowed to take.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid turn transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

/// The cumulative buffer handed to the parser does not extend what it has seen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cumulative buffer diverges from the {seen} bytes already parsed")]
pub struct BufferDiverged {
    pub seen: usize,
}
