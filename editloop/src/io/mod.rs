//! I/O adapters: filesystem, child processes, config and turn archives.

pub mod atomic;
pub mod base_tree;
pub mod commit;
pub mod config;
pub mod generator;
pub mod init;
pub mod process;
pub mod prompt;
pub mod staging;
pub mod turn_log;
pub mod typecheck;
