//! Synchronization primitives with cancel-aware waiting.
//!
//! # Primitives
//!
//! - [`AsyncQueue`]: FIFO rendezvous between `put` and `get` callers
//! - [`RwLock`]: reader-writer lock with an upgradable reader role
//!
//! # Common skeleton
//!
//! Both primitives serve waiters parked on FIFO queues under an
//! invariant. An operation acquires synchronously when the invariant
//! permits; otherwise it parks and is woken when a release (or `put`)
//! makes it admissible. Waiters are addressable by id, so cancellation
//! removes exactly one entry in one queue and leaves the rest untouched.
//!
//! # Cancel safety
//!
//! - Cancellation (or drop) while parked: clean removal, nothing held
//! - Cancellation after the scheduler already granted the acquisition:
//!   a no-op; the grant still belongs to the waiter and is delivered on
//!   its next poll
//! - Drop of a future whose grant was never claimed: the grant is
//!   released as if acquired and immediately dropped, so the next
//!   eligible waiter is scheduled and no wakeup is lost
//! - Panic while holding a lock guard: the lock is poisoned and the guard
//!   still releases via unwind

mod queue;
mod rwlock;

pub use queue::{AsyncQueue, GetError, GetFuture};
pub use rwlock::{
    ReadFuture, RwLock, RwLockError, RwLockReadGuard, RwLockUpgradableReadGuard,
    RwLockUpgradedWriteGuard, RwLockWriteGuard, TryReadError, TryUpgradableReadError,
    TryUpgradeError, TryWriteError, UpgradableReadFuture, UpgradeFuture, WriteFuture,
};
