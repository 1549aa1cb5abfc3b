//! Error kinds the engine distinguishes.
//!
//! Every fallible operation in the crate returns `Result<_, VtpeError>`.
//! `InvalidArgument` is the only variant that indicates programmer error;
//! `UninitializedUse` and `DoubleInit` describe conditions the engine
//! recovers from or defers, never a reason to panic or abort.
//!
//! Two conditions the engine also recovers from internally —
//! `PhysicalSpace::allocate` finding no evictable page this tick, and an
//! async load failing to open/seek/read its source — are deliberately
//! *not* variants here: neither is ever surfaced as a `Result::Err` to a
//! caller. The first is represented by the scheduler's own private
//! `TickOutcome::CapacityExhausted` and just leaves the request enqueued
//! for the next tick; the second is reported only through the loader's
//! `on_complete(bool, usize)` callback. Adding error variants that no
//! operation ever returns would just be dead API surface.

use thiserror::Error;

/// The error type returned by every fallible VTPE operation.
#[derive(Debug, Error)]
pub enum VtpeError {
    /// Out-of-range page coordinates, a mip `>= num_mips`, or a virtual
    /// address component that exceeds its encoding width. Always a logged,
    /// no-op failure; never propagated as a crash.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted on a [`VTSystem`](crate::system::VTSystem)
    /// before [`VTSystem::init`](crate::system::VTSystem::init) was called.
    #[error("VTSystem used before init()")]
    UninitializedUse,

    /// [`VTSystem::init`](crate::system::VTSystem::init) was called on an
    /// already-initialized system. Not an error the caller needs to act
    /// on: the existing system is left untouched and `init` still
    /// reports success.
    #[error("VTSystem already initialized")]
    DoubleInit,
}

/// Convenience alias for engine results.
pub type Result<T> = core::result::Result<T, VtpeError>;
