//! Error types used across the crate.
//!
//! There are three error types, matching the three failure tiers the
//! validation pipeline distinguishes:
//!
//! [`Failed`] marks that a single operation (a fetch, a store lookup) could
//! not complete. Diagnostic information has already been logged; callers
//! just need to propagate the failure.
//!
//! [`RunFailed`] marks that an entire trust-anchor validation run has to be
//! abandoned. It carries the message that ends up recorded on the
//! [`TrustAnchor`][crate::trust_anchor::TrustAnchor]'s `Idle` status.
//!
//! [`Fatal`] marks a system-level error (storage corruption, a missing
//! directory) serious enough that the operator should be told directly
//! rather than have it folded into per-TA scheduling.

use std::fmt;
use log::error;


//------------ Failed --------------------------------------------------------

/// An operation has failed to complete.
///
/// Diagnostic information has been logged already; the caller can't do
/// anything to recover beyond propagating the failure.
#[derive(Clone, Copy, Debug)]
pub struct Failed;

impl fmt::Display for Failed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation failed")
    }
}

impl std::error::Error for Failed { }


//------------ RunFailed ------------------------------------------------------

/// A trust-anchor validation run could not complete.
///
/// This is the tier-2 failure from the error handling design: an uncaught
/// condition during a run terminates it with a message that is both logged
/// and handed back to the scheduler for recording against the TA.
#[derive(Clone, Debug)]
pub struct RunFailed(String);

impl RunFailed {
    /// Creates a new run failure with the given message.
    pub fn message(msg: impl Into<String>) -> Self {
        RunFailed(msg.into())
    }

    /// Creates a generic run failure for an otherwise undiagnosed error.
    ///
    /// Used when a lower layer has already logged the specifics via
    /// [`Failed`] and there is nothing more useful to say here.
    pub fn fatal() -> Self {
        RunFailed("validation run failed".into())
    }

    /// Returns the message to be recorded on the trust anchor.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunFailed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for RunFailed { }

impl From<Failed> for RunFailed {
    fn from(_: Failed) -> Self {
        RunFailed::fatal()
    }
}


//------------ Fatal ----------------------------------------------------------

/// A system-level error that should be surfaced to the operator.
///
/// Per the error handling design's tier 3: storage corruption or
/// configuration errors that mean the whole process, not just one TA,
/// is in trouble. The TA stays in its last known state; the scheduler
/// will simply retry at the next tick.
#[derive(Clone, Copy, Debug)]
pub struct Fatal;

impl From<Failed> for Fatal {
    fn from(_: Failed) -> Fatal {
        error!("Fatal error. Exiting.");
        Fatal
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("fatal error")
    }
}

impl std::error::Error for Fatal { }
