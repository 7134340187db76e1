// src/codes.rs

//! Numeric result-code taxonomy shared by the step pipeline and the
//! download coordinator.
//!
//! Steps and fetch primitives report small signed integers instead of
//! structured errors so the whole pipeline stays uniform and the values
//! can be handed to callers and automation unchanged. The taxonomy is a
//! public contract; do not renumber.

/// Step or download completed.
pub const OK: i32 = 0;

/// Generic failure: verification failed after retries, or the operator
/// cancelled a download (terminal at the coordinator level).
pub const FAILED: i32 = 1;

/// The target vanished underneath us (package file removed mid-pipeline,
/// unpack found nothing to work with).
pub const VANISHED: i32 = 2;

/// Every mirror of a repository has been tried and dropped.
pub const MIRRORS_EXHAUSTED: i32 = 3;

/// A file could not be moved onto the live filesystem.
pub const MOVE_FAILED: i32 = 4;

/// The exclusive resource lock could not be acquired.
pub const LOCK_UNAVAILABLE: i32 = 20;

/// Unrecoverable I/O while talking to a mirror.
pub const FETCH_IO_ERROR: i32 = -1;

/// Downloaded data did not match the expected digest.
pub const FETCH_CHECKSUM_ERROR: i32 = -2;

/// The remote file does not exist on this mirror.
pub const FETCH_NOT_FOUND: i32 = -3;

/// The transfer timed out; retried on the same mirror up to
/// [`TIMEOUT_RETRIES`] times before moving on.
pub const FETCH_TIMEOUT: i32 = -4;

/// The operator interrupted the transfer. Never retried.
pub const FETCH_CANCELLED: i32 = -100;

/// Consecutive timeouts tolerated per mirror.
pub const TIMEOUT_RETRIES: u32 = 50;
