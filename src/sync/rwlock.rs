//! Reader-writer lock with an upgradable reader role.
//!
//! This lock coordinates four roles over one protected value:
//!
//! - **Readers** share the lock with each other and with the upgradable
//!   reader.
//! - A **writer** holds the lock exclusively.
//! - The **upgradable reader** is a singleton non-exclusive holder with a
//!   reserved path to becoming a writer.
//! - The **upgraded writer** is the upgradable reader after promotion:
//!   exclusive, and able to step back down by releasing the upgrade.
//!
//! Acquisition is cancel-safe: cancellation (or dropping the acquire
//! future) while parked removes the waiter without disturbing the others.
//! A cancellation that lands after the scheduler already assigned the
//! lock to a waiter is a no-op for that waiter (it keeps its
//! acquisition); a wakeup assigned to a future that is dropped unclaimed
//! is passed on to the next eligible waiter.
//!
//! # Fairness
//!
//! The lock is writer-preferring with FIFO queues per role. After any
//! release, waiters are admitted in this order, stopping at the first
//! rule that admits someone:
//!
//! | Rule | Admitted when |
//! |----------------------|------------------------------------------------|
//! | One writer           | no holder of any kind remains                  |
//! | One pending upgrade  | the upgradable reader is the sole holder       |
//! | One upgradable reader| no writer active, upgradable seat empty        |
//! | All queued readers   | no writer active, no writer/upgrade waiting    |
//!
//! A waiting writer or a waiting upgrade blocks *new* readers, so a
//! steady stream of readers cannot starve writers. An upgradable reader,
//! by contrast, may enter alongside active readers even while writers
//! wait: the role exists to register write intent without immediately
//! excluding readers.
//!
//! Reader starvation under continuous write pressure is possible, as with
//! any writer-preferring lock.
//!
//! # Upgrading
//!
//! [`RwLockUpgradableReadGuard::upgrade`] resolves once every plain
//! reader has released, and never deadlocks against readers admitted
//! after the upgradable reader: new readers are blocked while the upgrade
//! waits, and the existing ones drain independently. While the upgrade
//! waits and while the upgraded writer is live, the upgradable guard is
//! mutably borrowed, so it can neither be released nor upgraded twice.
//!
//! # Poisoning
//!
//! A panic while holding any guard poisons the lock; subsequent
//! acquisitions fail with a `Poisoned` error.
//!
//! # Example
//!
//! ```ignore
//! use coopsync::{CancelToken, RwLock};
//!
//! let token = CancelToken::new();
//! let lock = RwLock::new(Config::default());
//!
//! let current = lock.read(&token).await?;
//! drop(current);
//!
//! let mut ur = lock.upgradable_read(&token).await?;
//! if needs_refresh(&ur) {
//!     let mut w = ur.upgrade(&token).await?;
//!     w.refresh();
//! }
//! ```
//!
//! # No reentry
//!
//! The lock is not reentrant. A holder that awaits a second acquisition
//! of the same lock waits forever.

#![allow(unsafe_code)]

use parking_lot::Mutex as ParkingMutex;
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

use crate::cancel::CancelToken;

/// Error returned when acquiring a lock role fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwLockError {
    /// The lock was poisoned (a panic occurred while holding a guard).
    Poisoned,
    /// Cancelled while waiting.
    Cancelled,
}

impl std::fmt::Display for RwLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poisoned => write!(f, "rwlock poisoned"),
            Self::Cancelled => write!(f, "rwlock acquisition cancelled"),
        }
    }
}

impl std::error::Error for RwLockError {}

/// Error returned when trying to read without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryReadError {
    /// A writer is active, or a writer or upgrade is waiting.
    Locked,
    /// The lock was poisoned.
    Poisoned,
}

impl std::fmt::Display for TryReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "rwlock is write-locked or a writer is waiting"),
            Self::Poisoned => write!(f, "rwlock poisoned"),
        }
    }
}

impl std::error::Error for TryReadError {}

/// Error returned when trying to write without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryWriteError {
    /// The lock is held by readers, an upgradable reader, or a writer.
    Locked,
    /// The lock was poisoned.
    Poisoned,
}

impl std::fmt::Display for TryWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "rwlock is locked"),
            Self::Poisoned => write!(f, "rwlock poisoned"),
        }
    }
}

impl std::error::Error for TryWriteError {}

/// Error returned when trying to take the upgradable seat without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryUpgradableReadError {
    /// A writer is active or the upgradable seat is taken.
    Locked,
    /// The lock was poisoned.
    Poisoned,
}

impl std::fmt::Display for TryUpgradableReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "rwlock upgradable seat is unavailable"),
            Self::Poisoned => write!(f, "rwlock poisoned"),
        }
    }
}

impl std::error::Error for TryUpgradableReadError {}

/// Error returned when trying to upgrade without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryUpgradeError {
    /// Other readers still hold the lock.
    Locked,
    /// The lock was poisoned.
    Poisoned,
}

impl std::fmt::Display for TryUpgradeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "rwlock still has other holders"),
            Self::Poisoned => write!(f, "rwlock poisoned"),
        }
    }
}

impl std::error::Error for TryUpgradeError {}

#[derive(Debug, Clone)]
struct Waiter {
    id: u64,
    waker: Waker,
}

type WakeList = SmallVec<[Waker; 4]>;

/// Lock census and waiter bookkeeping.
///
/// `count` encodes the holders: `0` free, `> 0` that many readers (the
/// upgradable reader counts as one), `-1` one exclusive writer, plain or
/// upgraded.
#[derive(Debug, Clone)]
struct LockState {
    count: isize,
    /// Id of the live upgradable reader, if any.
    upgradeable: Option<u64>,
    /// True while the upgradable reader holds the upgraded writer role.
    /// Implies `upgradeable.is_some()` and `count == -1`.
    upgraded: bool,
    readers: VecDeque<Waiter>,
    upgradeables: VecDeque<Waiter>,
    upgrades: VecDeque<Waiter>,
    writers: VecDeque<Waiter>,
    /// Acquisitions already performed by `reschedule` on behalf of woken
    /// waiters that have not re-polled yet. An id in here is on no queue;
    /// the census already reflects the acquisition, which is what makes
    /// barging between wake and re-poll impossible.
    grants: SmallVec<[u64; 4]>,
    next_id: u64,
}

impl LockState {
    fn new() -> Self {
        Self {
            count: 0,
            upgradeable: None,
            upgraded: false,
            readers: VecDeque::new(),
            upgradeables: VecDeque::new(),
            upgrades: VecDeque::new(),
            writers: VecDeque::new(),
            grants: SmallVec::new(),
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// New readers are barred while a writer or an upgrade waits; this is
    /// the writer-preference policy.
    fn can_take_read(&self) -> bool {
        self.count >= 0 && self.writers.is_empty() && self.upgrades.is_empty()
    }

    /// The upgradable seat ignores the writer and upgrade queues: taking
    /// write *intent* is allowed alongside active readers even when
    /// writers wait.
    fn can_take_upgradable_read(&self) -> bool {
        self.count >= 0 && self.upgradeable.is_none()
    }

    fn can_take_write(&self) -> bool {
        self.count == 0
    }

    /// An upgrade completes only when the upgradable reader is the sole
    /// holder remaining.
    fn can_take_upgrade(&self) -> bool {
        self.count == 1 && self.upgradeable.is_some() && !self.upgraded
    }

    fn take_grant(&mut self, id: u64) -> bool {
        match self.grants.iter().position(|g| *g == id) {
            Some(pos) => {
                self.grants.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Admits waiters after a release (or after a cancellation removed a
    /// queued writer or upgrade, which can make queued readers
    /// admissible).
    ///
    /// Rules run in priority order and stop at the first that wakes
    /// someone: writers beat the pending upgrade, which beats queued
    /// upgradable readers, which beat queued readers. Readers are admitted
    /// as a batch to maximize parallelism; the batch cannot invalidate its
    /// own admission because readers only push `count` further above zero.
    ///
    /// The census is updated *here*, on behalf of the woken waiter. The
    /// waiter finds its acquisition in `grants` when it re-polls, so no
    /// synchronous acquirer can slip in between wake and re-poll.
    fn reschedule(&mut self, wake: &mut WakeList) {
        if self.can_take_write() {
            if let Some(waiter) = self.writers.pop_front() {
                self.count = -1;
                self.grants.push(waiter.id);
                wake.push(waiter.waker);
                return;
            }
        }
        if self.can_take_upgrade() {
            if let Some(waiter) = self.upgrades.pop_front() {
                self.count = -1;
                self.upgraded = true;
                self.grants.push(waiter.id);
                wake.push(waiter.waker);
                return;
            }
        }
        if self.can_take_upgradable_read() {
            if let Some(waiter) = self.upgradeables.pop_front() {
                self.count += 1;
                self.upgradeable = Some(waiter.id);
                self.grants.push(waiter.id);
                wake.push(waiter.waker);
                return;
            }
        }
        if self.can_take_read() {
            while let Some(waiter) = self.readers.pop_front() {
                self.count += 1;
                self.grants.push(waiter.id);
                wake.push(waiter.waker);
            }
        }
    }
}

fn remove_waiter(queue: &mut VecDeque<Waiter>, id: u64) -> bool {
    let before = queue.len();
    queue.retain(|w| w.id != id);
    queue.len() != before
}

fn refresh_waker(queue: &mut VecDeque<Waiter>, id: u64, context: &Context<'_>) {
    if let Some(existing) = queue.iter_mut().find(|w| w.id == id) {
        if !existing.waker.will_wake(context.waker()) {
            existing.waker.clone_from(context.waker());
        }
    }
}

/// A cancel-aware reader-writer lock with an upgradable reader role.
///
/// See the [module documentation](self) for the fairness policy and the
/// role semantics.
#[derive(Debug)]
pub struct RwLock<T> {
    /// The protected data.
    data: UnsafeCell<T>,
    /// Whether the lock is poisoned.
    poisoned: AtomicBool,
    state: ParkingMutex<LockState>,
}

// Safety: the census serializes access to `data`. Readers only share `&T`
// (requires `T: Sync` for `Sync`); a writer moves `&mut T` access to
// whichever thread holds the guard (requires `T: Send`).
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new lock containing the given value.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            data: UnsafeCell::new(value),
            poisoned: AtomicBool::new(false),
            state: ParkingMutex::new(LockState::new()),
        }
    }

    /// Returns true if the lock is poisoned.
    #[inline]
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Returns true if any role currently holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().count != 0
    }

    /// Returns the number of readers currently holding the lock,
    /// including the upgradable reader.
    ///
    /// The result is out of date the instant it is produced; use it as a
    /// heuristic only.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        let state = self.state.lock();
        usize::try_from(state.count).unwrap_or(0)
    }

    /// Acquires a read guard asynchronously, waiting if necessary.
    ///
    /// Readers are admitted immediately unless a writer is active or a
    /// writer/upgrade is waiting. The returned future is cancel-safe.
    pub fn read<'a, 'b>(&'a self, token: &'b CancelToken) -> ReadFuture<'a, 'b, T> {
        ReadFuture {
            lock: self,
            token,
            waiter_id: None,
        }
    }

    /// Tries to acquire a read guard without waiting.
    ///
    /// # Errors
    ///
    /// - [`TryReadError::Locked`] if a writer is active or a
    ///   writer/upgrade is waiting
    /// - [`TryReadError::Poisoned`] if the lock is poisoned
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, TryReadError> {
        if self.is_poisoned() {
            return Err(TryReadError::Poisoned);
        }
        let mut state = self.state.lock();
        if !state.can_take_read() {
            return Err(TryReadError::Locked);
        }
        state.count += 1;
        drop(state);
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquires the upgradable-reader seat asynchronously, waiting if
    /// necessary.
    ///
    /// The upgradable reader coexists with plain readers and may enter
    /// even while writers wait, but at most one upgradable reader exists
    /// at a time. The returned future is cancel-safe.
    pub fn upgradable_read<'a, 'b>(
        &'a self,
        token: &'b CancelToken,
    ) -> UpgradableReadFuture<'a, 'b, T> {
        UpgradableReadFuture {
            lock: self,
            token,
            waiter_id: None,
        }
    }

    /// Tries to acquire the upgradable-reader seat without waiting.
    ///
    /// # Errors
    ///
    /// - [`TryUpgradableReadError::Locked`] if a writer is active or the
    ///   seat is taken
    /// - [`TryUpgradableReadError::Poisoned`] if the lock is poisoned
    pub fn try_upgradable_read(
        &self,
    ) -> Result<RwLockUpgradableReadGuard<'_, T>, TryUpgradableReadError> {
        if self.is_poisoned() {
            return Err(TryUpgradableReadError::Poisoned);
        }
        let mut state = self.state.lock();
        if !state.can_take_upgradable_read() {
            return Err(TryUpgradableReadError::Locked);
        }
        let id = state.alloc_id();
        state.count += 1;
        state.upgradeable = Some(id);
        drop(state);
        Ok(RwLockUpgradableReadGuard { lock: self, id })
    }

    /// Acquires a write guard asynchronously, waiting if necessary.
    ///
    /// The writer is admitted once no holder of any kind remains. Queued
    /// writers acquire in FIFO order and take priority over queued
    /// readers. The returned future is cancel-safe.
    pub fn write<'a, 'b>(&'a self, token: &'b CancelToken) -> WriteFuture<'a, 'b, T> {
        WriteFuture {
            lock: self,
            token,
            waiter_id: None,
        }
    }

    /// Tries to acquire a write guard without waiting.
    ///
    /// Queued writers cannot be bypassed: whenever one is eligible the
    /// scheduler has already reserved the lock for it, so this fails with
    /// `Locked` rather than barging.
    ///
    /// # Errors
    ///
    /// - [`TryWriteError::Locked`] if any holder exists
    /// - [`TryWriteError::Poisoned`] if the lock is poisoned
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, TryWriteError> {
        if self.is_poisoned() {
            return Err(TryWriteError::Poisoned);
        }
        let mut state = self.state.lock();
        if !state.can_take_write() {
            return Err(TryWriteError::Locked);
        }
        state.count = -1;
        drop(state);
        Ok(RwLockWriteGuard { lock: self })
    }

    /// Returns a mutable reference to the inner value.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn get_mut(&mut self) -> &mut T {
        assert!(!self.is_poisoned(), "rwlock is poisoned");
        self.data.get_mut()
    }

    /// Consumes the lock and returns the inner value.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn into_inner(self) -> T {
        assert!(!self.is_poisoned(), "rwlock is poisoned");
        self.data.into_inner()
    }

    fn poison_if_panicking(&self) {
        if std::thread::panicking() {
            self.poisoned.store(true, Ordering::Release);
        }
    }

    fn wake_all(wake: WakeList) {
        for waker in wake {
            waker.wake();
        }
    }

    fn release_read(&self) {
        let mut wake = WakeList::new();
        {
            let mut state = self.state.lock();
            debug_assert!(state.count >= 1, "read release without reader census");
            state.count -= 1;
            state.reschedule(&mut wake);
        }
        Self::wake_all(wake);
    }

    fn release_write(&self) {
        let mut wake = WakeList::new();
        {
            let mut state = self.state.lock();
            debug_assert_eq!(state.count, -1, "write release without writer census");
            state.count = 0;
            state.reschedule(&mut wake);
        }
        Self::wake_all(wake);
    }

    fn release_upgradable(&self, id: u64) {
        let mut wake = WakeList::new();
        {
            let mut state = self.state.lock();
            debug_assert_eq!(state.upgradeable, Some(id));
            // The upgraded writer borrows the upgradable guard, so the
            // guard cannot be dropped while the upgrade is held.
            debug_assert!(!state.upgraded);
            debug_assert!(state.count >= 1);
            state.count -= 1;
            state.upgradeable = None;
            state.reschedule(&mut wake);
        }
        Self::wake_all(wake);
    }

    fn release_upgrade(&self) {
        let mut wake = WakeList::new();
        {
            let mut state = self.state.lock();
            debug_assert!(state.upgraded && state.count == -1);
            // Restore the upgradable-reader census; the upgradable guard
            // stays live and may release or upgrade again.
            state.upgraded = false;
            state.count = 1;
            state.reschedule(&mut wake);
        }
        Self::wake_all(wake);
    }

    #[cfg(test)]
    fn debug_state(&self) -> LockState {
        self.state.lock().clone()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Future returned by [`RwLock::read`].
#[must_use = "futures do nothing unless polled"]
pub struct ReadFuture<'a, 'b, T> {
    lock: &'a RwLock<T>,
    token: &'b CancelToken,
    waiter_id: Option<u64>,
}

impl<'a, T> Future for ReadFuture<'a, '_, T> {
    type Output = Result<RwLockReadGuard<'a, T>, RwLockError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.state.lock();

        // The scheduler pre-commits the census at wake time; a grant
        // that is already ours must be claimed even if cancellation
        // raced in behind it.
        if let Some(waiter_id) = self.waiter_id {
            if state.take_grant(waiter_id) {
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(RwLockReadGuard { lock: self.lock }));
            }
        }

        if self.token.checkpoint().is_err() {
            return Poll::Ready(Err(RwLockError::Cancelled));
        }
        if self.lock.is_poisoned() {
            return Poll::Ready(Err(RwLockError::Poisoned));
        }

        if let Some(waiter_id) = self.waiter_id {
            refresh_waker(&mut state.readers, waiter_id, context);
            drop(state);
            return Poll::Pending;
        }

        if state.can_take_read() {
            state.count += 1;
            drop(state);
            return Poll::Ready(Ok(RwLockReadGuard { lock: self.lock }));
        }

        let id = state.alloc_id();
        state.readers.push_back(Waiter {
            id,
            waker: context.waker().clone(),
        });
        drop(state);
        self.waiter_id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for ReadFuture<'_, '_, T> {
    fn drop(&mut self) {
        let Some(waiter_id) = self.waiter_id else {
            return;
        };
        let mut wake = WakeList::new();
        {
            let mut state = self.lock.state.lock();
            if remove_waiter(&mut state.readers, waiter_id) {
                // Nothing is gated on the reader queue; removal alone is
                // enough.
            } else if state.take_grant(waiter_id) {
                // The scheduler already counted us in; undo as a release.
                state.count -= 1;
                state.reschedule(&mut wake);
            }
        }
        RwLock::<T>::wake_all(wake);
    }
}

/// Future returned by [`RwLock::write`].
#[must_use = "futures do nothing unless polled"]
pub struct WriteFuture<'a, 'b, T> {
    lock: &'a RwLock<T>,
    token: &'b CancelToken,
    waiter_id: Option<u64>,
}

impl<'a, T> Future for WriteFuture<'a, '_, T> {
    type Output = Result<RwLockWriteGuard<'a, T>, RwLockError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.state.lock();

        // Claim a pre-committed grant before consulting the token; the
        // lock was already ours at wake time.
        if let Some(waiter_id) = self.waiter_id {
            if state.take_grant(waiter_id) {
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(RwLockWriteGuard { lock: self.lock }));
            }
        }

        if self.token.checkpoint().is_err() {
            return Poll::Ready(Err(RwLockError::Cancelled));
        }
        if self.lock.is_poisoned() {
            return Poll::Ready(Err(RwLockError::Poisoned));
        }

        if let Some(waiter_id) = self.waiter_id {
            refresh_waker(&mut state.writers, waiter_id, context);
            drop(state);
            return Poll::Pending;
        }

        if state.can_take_write() {
            state.count = -1;
            drop(state);
            return Poll::Ready(Ok(RwLockWriteGuard { lock: self.lock }));
        }

        let id = state.alloc_id();
        state.writers.push_back(Waiter {
            id,
            waker: context.waker().clone(),
        });
        drop(state);
        self.waiter_id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for WriteFuture<'_, '_, T> {
    fn drop(&mut self) {
        let Some(waiter_id) = self.waiter_id else {
            return;
        };
        let mut wake = WakeList::new();
        {
            let mut state = self.lock.state.lock();
            if remove_waiter(&mut state.writers, waiter_id) {
                // Removing a queued writer can make queued readers
                // admissible again.
                state.reschedule(&mut wake);
            } else if state.take_grant(waiter_id) {
                state.count = 0;
                state.reschedule(&mut wake);
            }
        }
        RwLock::<T>::wake_all(wake);
    }
}

/// Future returned by [`RwLock::upgradable_read`].
#[must_use = "futures do nothing unless polled"]
pub struct UpgradableReadFuture<'a, 'b, T> {
    lock: &'a RwLock<T>,
    token: &'b CancelToken,
    waiter_id: Option<u64>,
}

impl<'a, T> Future for UpgradableReadFuture<'a, '_, T> {
    type Output = Result<RwLockUpgradableReadGuard<'a, T>, RwLockError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.state.lock();

        // Claim a pre-committed seat before consulting the token; it
        // was already ours at wake time.
        if let Some(waiter_id) = self.waiter_id {
            if state.take_grant(waiter_id) {
                debug_assert_eq!(state.upgradeable, Some(waiter_id));
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(RwLockUpgradableReadGuard {
                    lock: self.lock,
                    id: waiter_id,
                }));
            }
        }

        if self.token.checkpoint().is_err() {
            return Poll::Ready(Err(RwLockError::Cancelled));
        }
        if self.lock.is_poisoned() {
            return Poll::Ready(Err(RwLockError::Poisoned));
        }

        if let Some(waiter_id) = self.waiter_id {
            refresh_waker(&mut state.upgradeables, waiter_id, context);
            drop(state);
            return Poll::Pending;
        }

        if state.can_take_upgradable_read() {
            let id = state.alloc_id();
            state.count += 1;
            state.upgradeable = Some(id);
            drop(state);
            return Poll::Ready(Ok(RwLockUpgradableReadGuard {
                lock: self.lock,
                id,
            }));
        }

        let id = state.alloc_id();
        state.upgradeables.push_back(Waiter {
            id,
            waker: context.waker().clone(),
        });
        drop(state);
        self.waiter_id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for UpgradableReadFuture<'_, '_, T> {
    fn drop(&mut self) {
        let Some(waiter_id) = self.waiter_id else {
            return;
        };
        let mut wake = WakeList::new();
        {
            let mut state = self.lock.state.lock();
            if remove_waiter(&mut state.upgradeables, waiter_id) {
                // No admission rule is gated on the upgradable queue.
            } else if state.take_grant(waiter_id) {
                debug_assert_eq!(state.upgradeable, Some(waiter_id));
                state.count -= 1;
                state.upgradeable = None;
                state.reschedule(&mut wake);
            }
        }
        RwLock::<T>::wake_all(wake);
    }
}

/// Future returned by [`RwLockUpgradableReadGuard::upgrade`].
///
/// Borrows the upgradable guard mutably for its whole life, so the guard
/// cannot be released (or upgraded again) while the upgrade is pending.
#[must_use = "futures do nothing unless polled"]
pub struct UpgradeFuture<'g, 'b, T> {
    lock: &'g RwLock<T>,
    token: &'b CancelToken,
    waiter_id: Option<u64>,
}

impl<'g, T> Future for UpgradeFuture<'g, '_, T> {
    type Output = Result<RwLockUpgradedWriteGuard<'g, T>, RwLockError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.state.lock();

        // Claim a pre-committed upgrade before consulting the token;
        // the exclusive role was already ours at wake time.
        if let Some(waiter_id) = self.waiter_id {
            if state.take_grant(waiter_id) {
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(RwLockUpgradedWriteGuard { lock: self.lock }));
            }
        }

        if self.token.checkpoint().is_err() {
            return Poll::Ready(Err(RwLockError::Cancelled));
        }
        if self.lock.is_poisoned() {
            return Poll::Ready(Err(RwLockError::Poisoned));
        }

        if let Some(waiter_id) = self.waiter_id {
            refresh_waker(&mut state.upgrades, waiter_id, context);
            drop(state);
            return Poll::Pending;
        }

        if state.can_take_upgrade() {
            state.count = -1;
            state.upgraded = true;
            drop(state);
            return Poll::Ready(Ok(RwLockUpgradedWriteGuard { lock: self.lock }));
        }

        let id = state.alloc_id();
        state.upgrades.push_back(Waiter {
            id,
            waker: context.waker().clone(),
        });
        drop(state);
        self.waiter_id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for UpgradeFuture<'_, '_, T> {
    fn drop(&mut self) {
        let Some(waiter_id) = self.waiter_id else {
            return;
        };
        let mut wake = WakeList::new();
        {
            let mut state = self.lock.state.lock();
            if remove_waiter(&mut state.upgrades, waiter_id) {
                // Removing the pending upgrade can make queued readers
                // admissible again.
                state.reschedule(&mut wake);
            } else if state.take_grant(waiter_id) {
                // Granted but never claimed: step back down to the
                // upgradable-reader census.
                state.upgraded = false;
                state.count = 1;
                state.reschedule(&mut wake);
            }
        }
        RwLock::<T>::wake_all(wake);
    }
}

/// Guard for a read lock.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

// Safety: the guard only exposes `&T`.
unsafe impl<T: Sync> Send for RwLockReadGuard<'_, T> {}
unsafe impl<T: Sync> Sync for RwLockReadGuard<'_, T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockReadGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: `count >= 1` while this guard is live, so no exclusive
        // holder exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.poison_if_panicking();
        self.lock.release_read();
    }
}

/// Guard for a write lock.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

unsafe impl<T: Send> Send for RwLockWriteGuard<'_, T> {}
unsafe impl<T: Sync> Sync for RwLockWriteGuard<'_, T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockWriteGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: `count == -1` while this guard is live; it is the sole
        // holder.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as for `deref`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.poison_if_panicking();
        self.lock.release_write();
    }
}

/// Guard for the upgradable-reader seat.
///
/// Behaves as a read guard, and additionally owns the reserved path to
/// the writer role via [`upgrade`](Self::upgrade).
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockUpgradableReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    id: u64,
}

unsafe impl<T: Send + Sync> Send for RwLockUpgradableReadGuard<'_, T> {}
unsafe impl<T: Sync> Sync for RwLockUpgradableReadGuard<'_, T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockUpgradableReadGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockUpgradableReadGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> RwLockUpgradableReadGuard<'_, T> {
    /// Upgrades to an exclusive writer, waiting for the other readers to
    /// release.
    ///
    /// The upgrade resolves as soon as this guard is the sole holder.
    /// While it waits, new readers and writers are blocked behind it, and
    /// the readers already inside drain independently, so the upgrade
    /// cannot deadlock against readers admitted after this guard.
    ///
    /// Dropping the returned [`RwLockUpgradedWriteGuard`] releases only
    /// the upgrade: this guard reverts to an upgradable reader and stays
    /// usable.
    ///
    /// # Errors
    ///
    /// The returned future resolves to [`RwLockError::Cancelled`] if
    /// `token` is cancelled first, or [`RwLockError::Poisoned`] if the
    /// lock is poisoned.
    pub fn upgrade<'g, 'b>(&'g mut self, token: &'b CancelToken) -> UpgradeFuture<'g, 'b, T> {
        UpgradeFuture {
            lock: self.lock,
            token,
            waiter_id: None,
        }
    }

    /// Tries to upgrade without waiting.
    ///
    /// # Errors
    ///
    /// - [`TryUpgradeError::Locked`] if other readers still hold the lock
    /// - [`TryUpgradeError::Poisoned`] if the lock is poisoned
    pub fn try_upgrade(&mut self) -> Result<RwLockUpgradedWriteGuard<'_, T>, TryUpgradeError> {
        if self.lock.is_poisoned() {
            return Err(TryUpgradeError::Poisoned);
        }
        let mut state = self.lock.state.lock();
        if !state.can_take_upgrade() {
            return Err(TryUpgradeError::Locked);
        }
        debug_assert_eq!(state.upgradeable, Some(self.id));
        state.count = -1;
        state.upgraded = true;
        drop(state);
        Ok(RwLockUpgradedWriteGuard { lock: self.lock })
    }
}

impl<T> Deref for RwLockUpgradableReadGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: `count >= 1` while this guard is live and not upgraded;
        // while upgraded, the guard is mutably borrowed and cannot deref.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockUpgradableReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.poison_if_panicking();
        self.lock.release_upgradable(self.id);
    }
}

/// Guard for the upgraded writer role.
///
/// Holds the lock exclusively. Dropping it releases only the upgrade:
/// the upgradable guard it was created from reverts to a reader.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockUpgradedWriteGuard<'g, T> {
    lock: &'g RwLock<T>,
}

unsafe impl<T: Send> Send for RwLockUpgradedWriteGuard<'_, T> {}
unsafe impl<T: Sync> Sync for RwLockUpgradedWriteGuard<'_, T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockUpgradedWriteGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockUpgradedWriteGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> Deref for RwLockUpgradedWriteGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: `count == -1` with the upgraded role set while this
        // guard is live; it is the sole holder with data access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockUpgradedWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as for `deref`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockUpgradedWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.poison_if_panicking();
        self.lock.release_upgrade();
    }
}
