//! Stable exit codes for dodder CLI commands.

/// Command succeeded, or the session ended normally.
pub const OK: i32 = 0;
/// Invalid options, configuration, or any other failure.
pub const FAILED: i32 = 1;
/// The model backend could not be reached.
pub const BACKEND_UNAVAILABLE: i32 = 2;
/// The user pressed Ctrl-C twice.
pub const INTERRUPTED: i32 = 130;
