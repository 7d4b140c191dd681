//! Cancellation signalling for cooperative waits.
//!
//! [`CancelToken`] is a cloneable flag shared between the party that
//! requests cancellation and the operations that observe it. Awaiting
//! operations call [`CancelToken::checkpoint`] at every poll; once the
//! token is cancelled the operation resolves with a cancellation error
//! instead of acquiring anything.
//!
//! A freshly created token is never cancelled, so passing
//! `&CancelToken::new()` is the "no cancellation" case.
//!
//! # Example
//!
//! ```
//! use coopsync::cancel::CancelToken;
//!
//! let token = CancelToken::new();
//! assert!(token.checkpoint().is_ok());
//!
//! token.cancel();
//! assert!(token.is_cancelled());
//! assert!(token.checkpoint().is_err());
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Error returned when an operation observes a cancelled token.
///
/// This is the stable sentinel for cancellation: every primitive in this
/// crate that can be cancelled surfaces it (possibly wrapped in the
/// primitive's own error enum), and nothing else produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// A cloneable cancellation token.
///
/// Clones share the same underlying flag, so cancelling any clone cancels
/// them all. Cancellation is one-way: there is no un-cancel.
///
/// Cancellation is observed, not delivered: a parked waiter notices the
/// token at its next poll. Dropping the waiting future has the same
/// effect as cancellation from the primitive's point of view (the waiter
/// is removed from its queue either way).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a new token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Checks for cancellation, returning an error if cancelled.
    ///
    /// Combines the flag check with an error return so call sites can use
    /// the `?` operator.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] once [`cancel`](Self::cancel) has been called
    /// on this token or any of its clones.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Requests cancellation.
    ///
    /// All clones of this token observe the request. Calling this more
    /// than once is a no-op.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
