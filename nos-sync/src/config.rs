//! Compile-time configuration of the synchronization core.

/// Lowest scheduling priority.
pub const PRI_MIN: u8 = 0;

/// Priority given to a context that does not ask for one.
pub const PRI_DEFAULT: u8 = 31;

/// Highest scheduling priority.
pub const PRI_MAX: u8 = 63;

/// Whether donation-graph invariants are re-verified after every mutation.
///
/// Enabled by the `debug_checks` feature and always on in unit tests.
pub const CHECK_INVARIANTS: bool = cfg!(any(test, feature = "debug_checks"));
