//! Stable exit codes for pilot CLI commands.

/// Command succeeded, or the inspected run completed successfully.
pub const OK: i32 = 0;
/// Command failed due to invalid config/snapshot or other errors.
pub const INVALID: i32 = 1;
/// The inspected run ended in failure.
pub const FAILED: i32 = 2;
/// The inspected run was aborted (step budget exhausted or cancelled).
pub const ABORTED: i32 = 3;
/// The inspected run has not reached a terminal state yet.
pub const RUNNING: i32 = 4;
