//! The one error type every fallible public API in this crate returns.
//!
//! Structural bugs (a timeout landing in the wrong wheel bucket, a worker
//! asked to `stop()` itself from its own thread) are not represented here —
//! those `panic!` at the call site per the invariant they violate, since they
//! can only be caused by a defect in this crate, never by caller input.

use thiserror::Error;

/// Error taxonomy for the corenet core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// `retain`/`release` preconditions violated: a release past zero, a
    /// retain that would overflow, or a retain on an already-dead resource.
    #[error("illegal reference count: count={count}, delta={delta:+}")]
    IllegalReferenceCount { count: i64, delta: i64 },

    /// Submission rejected by a shut-down executor/timer, or admission
    /// limits exceeded.
    #[error("rejected execution: {reason}")]
    RejectedExecution { reason: &'static str },

    /// An operation was attempted against a component in a state that
    /// forbids it (e.g. starting an already-shut-down timer).
    #[error("illegal state: {reason}")]
    IllegalState { reason: &'static str },

    /// An index, length, or key violated a structural invariant (e.g. a
    /// constant-pool name collision).
    #[error("out of range: {reason}")]
    OutOfRange { reason: &'static str },
}

pub type CoreResult<T> = Result<T, CoreError>;
