//! Stable exit codes for editloop CLI commands.

/// Command succeeded or the turn ended clean.
pub const OK: i32 = 0;
/// Invalid input, config or any other runtime error.
pub const INVALID: i32 = 1;
/// The turn ended `failed` (repair budget or collaborator unavailable).
pub const TURN_FAILED: i32 = 2;
/// The turn was cancelled.
pub const CANCELLED: i32 = 3;
