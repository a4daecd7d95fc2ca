//! Deterministic, pure logic shared by the edit loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod applier;
pub mod directive;
pub mod error;
pub mod overlay;
pub mod parser;
pub mod path;
pub mod problem;
pub mod session;
