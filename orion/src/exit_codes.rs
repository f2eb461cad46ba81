//! Stable exit codes for orion CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Config could not be loaded or failed validation.
pub const INVALID: i32 = 1;
/// Persisted state could not be read, or the runtime failed after start.
pub const FAILURE: i32 = 2;
