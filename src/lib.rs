//! Cancel-aware cooperative concurrency primitives.
//!
//! Coopsync provides two primitives for cooperatively-scheduled programs:
//!
//! - [`sync::AsyncQueue`]: a FIFO rendezvous point between producers
//!   (`put`, never blocks) and consumers (`get`, awaits a value).
//! - [`sync::RwLock`]: a reader-writer lock with a third, *upgradable*
//!   reader role that can promote itself to a writer without ever giving
//!   up its place in line.
//!
//! Both primitives follow the same skeleton: an operation either completes
//! immediately when the current state permits, or parks a waiter on a FIFO
//! queue; a release (or `put`) re-evaluates the state and wakes waiters in
//! policy order.
//!
//! # Cancellation
//!
//! Every awaiting operation takes a [`cancel::CancelToken`] and observes it
//! at each poll. A waiter cancelled while parked is excised from its queue
//! without disturbing the other waiters and without losing a wakeup; the
//! same holds for a waiter whose future is simply dropped.
//!
//! # Example
//!
//! ```ignore
//! use coopsync::{CancelToken, RwLock};
//!
//! let token = CancelToken::new();
//! let lock = RwLock::new(Vec::new());
//!
//! // Many readers may hold the lock at once.
//! let r1 = lock.read(&token).await?;
//! let r2 = lock.read(&token).await?;
//! drop((r1, r2));
//!
//! // An upgradable reader coexists with readers, then promotes itself.
//! let mut ur = lock.upgradable_read(&token).await?;
//! let mut w = ur.upgrade(&token).await?;
//! w.push(1);
//! ```
//!
//! # No reentry
//!
//! The lock is not reentrant: a holder that awaits a second acquisition
//! of the same lock waits forever.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cancel;
pub mod sync;
pub mod test_utils;

pub use cancel::{CancelToken, Cancelled};
pub use sync::{AsyncQueue, RwLock};
