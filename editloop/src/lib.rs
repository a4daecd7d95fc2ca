//! Streamed agent output to verified file mutations.
//!
//! A generating agent's response arrives as text chunks with `<edit-*>`
//! directives embedded in it. This crate parses those directives as they
//! close, applies them to an in-memory overlay over the project tree,
//! typechecks the result and feeds compiler problems back to the agent until
//! the tree is clean or the repair budget runs out. Nothing touches the
//! project on disk until a caller commits the overlay.
//!
//! - **[`core`]**: Pure, deterministic logic (paths, parsing, overlay,
//!   application order, turn state). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (filesystem, child processes,
//!   config, turn archives). Collaborators sit behind traits so tests can
//!   script them.
//!
//! Orchestration modules ([`controller`], [`registry`], [`apply`]) compose
//! core logic with I/O to implement turns and CLI commands.

pub mod apply;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
