//! Stable exit codes for `du-agent` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, unreadable snapshot, or any other error.
pub const INVALID: i32 = 1;
/// `du-agent snapshot` found no persisted snapshot.
pub const NO_SNAPSHOT: i32 = 2;
