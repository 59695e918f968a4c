//! Process exit codes.
//! Library failures exit with `KeytraceError::exit_code` (3 and up); these cover the rest.

pub const SUCCESS: i32 = 0;
pub const NOT_VERIFIED: i32 = 1; // At least one claim or self-test failed
pub const INTERNAL_ERROR: i32 = 2;
