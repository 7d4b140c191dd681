//! Asynchronous FIFO rendezvous queue.
//!
//! [`AsyncQueue`] brokers values between producers and consumers. `put`
//! never blocks: it hands the value to the oldest parked consumer, or
//! buffers it when nobody is waiting. `get` resolves immediately from the
//! buffer, or parks until a value arrives.
//!
//! # Ordering
//!
//! Rendezvous is strict FIFO between the two ends: the k-th completed
//! `get` receives the value of the k-th `put`, regardless of how the two
//! sides interleave. A value is bound to its consumer at `put` time, so a
//! consumer that parked first cannot have its value stolen by one that
//! merely polled first afterwards.
//!
//! # Cancel safety
//!
//! Dropping a parked [`GetFuture`] removes its waiter. Dropping one whose
//! value was already bound re-delivers that value to the next parked
//! consumer (or returns it to the front of the buffer), so no value is
//! ever lost.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::cancel::CancelToken;

/// Error returned when a `get` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetError {
    /// Cancelled while waiting for a value.
    Cancelled,
}

impl std::fmt::Display for GetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "queue get cancelled"),
        }
    }
}

impl std::error::Error for GetError {}

#[derive(Debug)]
struct GetWaiter {
    id: u64,
    waker: Waker,
}

#[derive(Debug)]
struct QueueState<T> {
    /// Buffered values, oldest first.
    available: VecDeque<T>,
    /// Parked consumers, oldest first.
    pending: VecDeque<GetWaiter>,
    /// Values already bound to a woken consumer that has not re-polled yet.
    settled: SmallVec<[(u64, T); 2]>,
    /// Monotonic counter for waiter identity.
    next_waiter_id: u64,
}

impl<T> QueueState<T> {
    fn new(available: VecDeque<T>) -> Self {
        Self {
            available,
            pending: VecDeque::new(),
            settled: SmallVec::new(),
            next_waiter_id: 0,
        }
    }

    /// Binds `value` to the oldest parked consumer, or buffers it at the
    /// position given by `buffer` when nobody is waiting. Returns the
    /// waker to wake outside the state lock.
    fn deliver(&mut self, value: T, buffer: BufferEnd) -> Option<Waker> {
        match self.pending.pop_front() {
            Some(waiter) => {
                self.settled.push((waiter.id, value));
                Some(waiter.waker)
            }
            None => {
                match buffer {
                    BufferEnd::Back => self.available.push_back(value),
                    BufferEnd::Front => self.available.push_front(value),
                }
                None
            }
        }
    }
}

/// Where an undelivered value lands in the buffer.
#[derive(Clone, Copy)]
enum BufferEnd {
    /// A fresh `put`: the value is the newest.
    Back,
    /// A value reclaimed from an abandoned consumer: it is the oldest.
    Front,
}

/// An asynchronous FIFO queue brokering values between `put` and `get`.
///
/// The queue is unbounded on both sides: any number of values may be
/// buffered and any number of consumers may be parked, but never both at
/// once.
///
/// # Example
///
/// ```ignore
/// use coopsync::{AsyncQueue, CancelToken};
///
/// let token = CancelToken::new();
/// let queue = AsyncQueue::new();
///
/// queue.put(1);
/// assert_eq!(queue.get(&token).await, Ok(1));
/// ```
#[derive(Debug)]
pub struct AsyncQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T> AsyncQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::new(VecDeque::new())),
        }
    }

    /// Offers a value to the queue. Never blocks.
    ///
    /// If a consumer is parked, the value is bound to the oldest one and
    /// that consumer is woken; otherwise the value is buffered.
    pub fn put(&self, value: T) {
        let waker = {
            let mut state = self.state.lock();
            state.deliver(value, BufferEnd::Back)
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Takes the next value, waiting until one is offered.
    ///
    /// Resolves in strict FIFO order with respect to `put`: the k-th
    /// completed `get` receives the k-th value.
    ///
    /// # Errors
    ///
    /// The returned future resolves to [`GetError::Cancelled`] if `token`
    /// is cancelled before a value is bound to this consumer. A
    /// cancellation that lands after the rendezvous is a no-op: the
    /// value is still delivered.
    pub fn get<'a, 'b>(&'a self, token: &'b CancelToken) -> GetFuture<'a, 'b, T> {
        GetFuture {
            queue: self,
            token,
            waiter_id: None,
        }
    }

    /// Takes the next buffered value without waiting.
    ///
    /// Returns `None` when the buffer is empty, including when consumers
    /// are parked (the buffer and the consumer queue are never both
    /// non-empty).
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        self.state.lock().available.pop_front()
    }

    /// Returns the number of buffered values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Returns true if no values are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().available.is_empty()
    }

    /// Returns the number of parked consumers.
    #[must_use]
    pub fn waiting_gets(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns the queue balance: positive when values are buffered,
    /// negative when consumers are parked, zero when neither.
    ///
    /// At most one of the two terms is non-zero at any time. Values
    /// already bound to a woken consumer count toward neither side.
    #[must_use]
    pub fn size(&self) -> isize {
        let state = self.state.lock();
        state.available.len() as isize - state.pending.len() as isize
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for AsyncQueue<T> {
    /// Creates a queue pre-filled with `iter`'s values, oldest first.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            state: Mutex::new(QueueState::new(iter.into_iter().collect())),
        }
    }
}

/// Future returned by [`AsyncQueue::get`].
#[must_use = "futures do nothing unless polled"]
pub struct GetFuture<'a, 'b, T> {
    queue: &'a AsyncQueue<T>,
    token: &'b CancelToken,
    waiter_id: Option<u64>,
}

impl<T> Future for GetFuture<'_, '_, T> {
    type Output = Result<T, GetError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.queue.state.lock();

        if let Some(waiter_id) = self.waiter_id {
            // A put may have bound a value to us while we were parked.
            // That rendezvous already happened, so claim the value even
            // if cancellation raced in behind it.
            if let Some(pos) = state.settled.iter().position(|(id, _)| *id == waiter_id) {
                let (_, value) = state.settled.swap_remove(pos);
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(value));
            }
        }

        if self.token.checkpoint().is_err() {
            return Poll::Ready(Err(GetError::Cancelled));
        }

        if let Some(waiter_id) = self.waiter_id {
            // Still parked — update the waker in case it changed. Some
            // executors provide a different waker on each poll; failing to
            // update would leave the consumer unwakeable.
            if let Some(existing) = state.pending.iter_mut().find(|w| w.id == waiter_id) {
                if !existing.waker.will_wake(context.waker()) {
                    existing.waker.clone_from(context.waker());
                }
            }
            drop(state);
            return Poll::Pending;
        }

        // The buffer is only non-empty when no consumer is parked, so
        // taking from it here cannot overtake an older consumer.
        if let Some(value) = state.available.pop_front() {
            return Poll::Ready(Ok(value));
        }

        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.pending.push_back(GetWaiter {
            id,
            waker: context.waker().clone(),
        });
        drop(state);
        self.waiter_id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for GetFuture<'_, '_, T> {
    fn drop(&mut self) {
        let Some(waiter_id) = self.waiter_id else {
            return;
        };

        let waker = {
            let mut state = self.queue.state.lock();

            let before = state.pending.len();
            state.pending.retain(|w| w.id != waiter_id);
            if state.pending.len() != before {
                None
            } else if let Some(pos) = state.settled.iter().position(|(id, _)| *id == waiter_id) {
                // A value was bound to us but never claimed. Hand it to
                // the next consumer in line, or return it to the front of
                // the buffer (it is the oldest outstanding value).
                let (_, value) = state.settled.swap_remove(pos);
                state.deliver(value, BufferEnd::Front)
            } else {
                None
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
