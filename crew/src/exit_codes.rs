//! Stable exit codes for crew CLI commands.

/// Command succeeded; for `crew run`, the task produced a result.
pub const OK: i32 = 0;
/// Invalid config, arguments, or any other error.
pub const INVALID: i32 = 1;
/// `crew run` spent every retry attempt without a result.
pub const EXHAUSTED: i32 = 2;
/// `crew run` stopped because a worker acted outside its capability set.
pub const CAPABILITY_VIOLATION: i32 = 3;
