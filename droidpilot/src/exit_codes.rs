//! Stable exit codes for `droidpilot` commands.

/// Test passed, or a non-run command succeeded.
pub const PASS: i32 = 0;
/// Invalid procedure, config or arguments, or a setup error before the run started.
pub const INVALID: i32 = 1;
/// Test failed.
pub const FAIL: i32 = 2;
/// A pass verdict could not be confirmed; a human has to look.
pub const NEEDS_REVIEW: i32 = 3;
