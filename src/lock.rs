//! Fair async lock with arrival-order granting.
//!
//! [`Lock`] grants exclusive access to one requester at a time, in strict
//! FIFO order. The queue head *is* the holder: an empty queue means the lock
//! is free, and releasing pops the head and grants the new head. Acquisition
//! has two independent knobs ([`AcquireMode`]): fail immediately instead of
//! waiting, and bound the wait by a deadline.
//!
//! The lock protects no data of its own; the protected section is whatever
//! the caller runs between grant and release.
//!
//! # Cancel Safety
//!
//! Dropping an [`AcquireFuture`] before it resolves removes its waiter from
//! the queue. If the waiter had already been granted but never observed the
//! grant, the drop releases the lock and passes the baton to the next waiter,
//! so an abandoned grant is never lost.
//!
//! # Example
//!
//! ```
//! use fairlock::Lock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let lock = Lock::new();
//! let value = lock.run_exclusive(|| async { 42 }).await.expect("uncontended");
//! assert_eq!(value, 42);
//! assert!(!lock.is_locked());
//! # }
//! ```

use parking_lot::Mutex as ParkingMutex;
use pin_project::{pin_project, pinned_drop};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::time::Sleep;
use tracing::trace;

use crate::error::LockError;

/// Acquisition mode: the two knobs of [`Lock::acquire_with`].
///
/// The default mode waits indefinitely. [`non_blocking`](Self::non_blocking)
/// makes the request fail with [`LockError::Held`] instead of queueing behind
/// a holder; [`timeout`](Self::timeout) bounds the wait, failing with
/// [`LockError::TimedOut`] once the deadline elapses. A timeout is only
/// meaningful for a blocking request and is ignored otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireMode {
    blocking: bool,
    timeout: Option<Duration>,
}

impl AcquireMode {
    /// The default mode: wait indefinitely for the grant.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocking: true,
            timeout: None,
        }
    }

    /// Fail immediately with [`LockError::Held`] if the lock is held.
    ///
    /// A refused request never enters the queue. On a free lock a
    /// non-blocking request is granted like any other first-in-line request.
    #[must_use]
    pub const fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    /// Give up with [`LockError::TimedOut`] if the grant has not arrived
    /// within `timeout`.
    ///
    /// The deadline only matters while the request is queued; once granted,
    /// the holder keeps the lock for as long as it likes.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for AcquireMode {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued or holding acquisition request.
#[derive(Debug)]
struct Waiter {
    id: u64,
    /// Resolved flag for the grant-vs-timeout race: set exactly once, when
    /// this waiter becomes the holder.
    granted: bool,
    /// Absent only for a holder that was granted synchronously and therefore
    /// never parked.
    waker: Option<Waker>,
}

#[derive(Debug)]
struct LockState {
    /// Arrival order; the head, if any, is the holder.
    queue: VecDeque<Waiter>,
    /// Monotonic counter for waiter identity.
    next_waiter_id: u64,
}

impl LockState {
    fn enqueue(&mut self, waker: Option<Waker>) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        // A request arriving at an empty queue is the holder on arrival.
        let granted = self.queue.is_empty();
        self.queue.push_back(Waiter { id, granted, waker });
        id
    }

    fn is_granted(&self, id: u64) -> bool {
        self.queue.front().is_some_and(|w| w.id == id && w.granted)
    }

    /// Re-registers the waker for a queued waiter. Some executors hand out a
    /// different waker on each poll; failing to track it would strand the
    /// task.
    fn update_waker(&mut self, id: u64, waker: &Waker) {
        if let Some(entry) = self.queue.iter_mut().find(|w| w.id == id) {
            let up_to_date = entry
                .waker
                .as_ref()
                .is_some_and(|current| current.will_wake(waker));
            if !up_to_date {
                entry.waker = Some(waker.clone());
            }
        }
    }

    /// Removes a waiter and, when it held the head slot, grants the new head
    /// and returns its waker. The waker must be woken outside the state lock.
    fn remove_and_grant_next(&mut self, id: u64) -> Option<Waker> {
        if self.queue.front().is_some_and(|w| w.id == id) {
            // O(1): the departing waiter is the holder (release, or a grant
            // abandoned before it was observed).
            self.queue.pop_front();
            let next = self.queue.front_mut()?;
            next.granted = true;
            next.waker.take()
        } else {
            // Positional removal (timeout or abandonment mid-queue) keeps
            // the relative order of the remaining waiters.
            if let Some(pos) = self.queue.iter().position(|w| w.id == id) {
                self.queue.remove(pos);
            }
            None
        }
    }
}

/// A fair asynchronous lock.
///
/// Grants are issued strictly in arrival order among queued requests; a
/// waiter removed by timeout or cancellation does not consume a grant and
/// does not disturb the order of the rest.
#[derive(Debug)]
pub struct Lock {
    state: ParkingMutex<LockState>,
}

impl Lock {
    /// Creates a new, unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParkingMutex::new(LockState {
                queue: VecDeque::with_capacity(4),
                next_waiter_id: 0,
            }),
        }
    }

    /// Returns true iff the lock is currently held.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    /// Returns the number of requests waiting behind the holder.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len().saturating_sub(1)
    }

    /// Acquires the lock, waiting indefinitely for the grant.
    pub fn acquire(&self) -> AcquireFuture<'_> {
        self.acquire_with(AcquireMode::new())
    }

    /// Acquires the lock with explicit [`AcquireMode`] knobs.
    pub fn acquire_with(&self, mode: AcquireMode) -> AcquireFuture<'_> {
        AcquireFuture {
            lock: self,
            mode,
            waiter: None,
            completed: false,
            timer: None,
        }
    }

    /// Tries to acquire the lock without waiting.
    ///
    /// Fails with [`LockError::Held`] whenever the queue is non-empty — a
    /// late arrival cannot barge past a waiter that was granted but has not
    /// yet resumed.
    pub fn try_acquire(&self) -> Result<LockGuard<'_>, LockError> {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            return Err(LockError::Held);
        }
        let id = state.enqueue(None);
        drop(state);
        trace!(waiter = id, "acquired");
        Ok(LockGuard { lock: self, waiter: id })
    }

    /// Acquires the lock from an [`Arc`], returning a guard without a
    /// lifetime. Useful when the guard must move into a spawned task.
    pub async fn acquire_owned(self: Arc<Self>) -> Result<OwnedLockGuard, LockError> {
        self.acquire_owned_with(AcquireMode::new()).await
    }

    /// Owned counterpart of [`acquire_with`](Self::acquire_with).
    pub async fn acquire_owned_with(
        self: Arc<Self>,
        mode: AcquireMode,
    ) -> Result<OwnedLockGuard, LockError> {
        let guard = self.acquire_with(mode).await?;
        let waiter = guard.waiter;
        // Transfer the release obligation to the owned guard without
        // releasing in between.
        std::mem::forget(guard);
        Ok(OwnedLockGuard { lock: self, waiter })
    }

    /// Runs `work` while holding the lock, releasing on every exit path.
    ///
    /// The lock is released after `work`'s future settles — on normal
    /// completion, on panic (via unwind), and when the returned future is
    /// dropped mid-work. The output of `work` is passed through unchanged.
    pub async fn run_exclusive<F, Fut>(&self, work: F) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.run_exclusive_with(AcquireMode::new(), work).await
    }

    /// Runs `work` while holding the lock, acquiring with `mode`.
    ///
    /// An acquisition failure is propagated without running `work` at all.
    pub async fn run_exclusive_with<F, Fut>(
        &self,
        mode: AcquireMode,
        work: F,
    ) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let guard = self.acquire_with(mode).await?;
        let output = work().await;
        guard.release();
        Ok(output)
    }

    /// Removes a waiter, advancing the queue when it was the holder.
    fn unlock(&self, id: u64) {
        // Wake outside the state lock: waking under it invites deadlock if
        // the woken task polls immediately.
        let next = {
            let mut state = self.state.lock();
            state.remove_and_grant_next(id)
        };
        if let Some(waker) = next {
            waker.wake();
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Lock::acquire`] and [`Lock::acquire_with`].
///
/// The first poll enters the queue (or refuses, in non-blocking mode);
/// subsequent polls observe the grant or the deadline, whichever resolves
/// first. Both transitions serialize on the lock's internal state, and a
/// grant that lands first always wins: the deadline cannot fire for a waiter
/// that already holds the lock.
#[pin_project(PinnedDrop)]
#[derive(Debug)]
pub struct AcquireFuture<'a> {
    lock: &'a Lock,
    mode: AcquireMode,
    waiter: Option<u64>,
    completed: bool,
    /// Armed lazily, on the poll that parks the request behind a holder.
    /// Dropped with the future, which cancels the deadline on grant.
    #[pin]
    timer: Option<Sleep>,
}

impl<'a> Future for AcquireFuture<'a> {
    type Output = Result<LockGuard<'a>, LockError>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        assert!(!*this.completed, "AcquireFuture polled after completion");

        if let Some(id) = *this.waiter {
            let mut state = this.lock.state.lock();
            if state.is_granted(id) {
                drop(state);
                *this.waiter = None;
                *this.completed = true;
                trace!(waiter = id, "granted");
                return Poll::Ready(Ok(LockGuard {
                    lock: *this.lock,
                    waiter: id,
                }));
            }
            state.update_waker(id, context.waker());
            drop(state);
        } else {
            let mut state = this.lock.state.lock();
            if !this.mode.blocking && !state.queue.is_empty() {
                drop(state);
                *this.completed = true;
                return Poll::Ready(Err(LockError::Held));
            }
            let id = state.enqueue(Some(context.waker().clone()));
            if state.is_granted(id) {
                drop(state);
                *this.completed = true;
                trace!(waiter = id, "acquired");
                return Poll::Ready(Ok(LockGuard {
                    lock: *this.lock,
                    waiter: id,
                }));
            }
            drop(state);
            *this.waiter = Some(id);
            trace!(waiter = id, "enqueued");
            if let Some(timeout) = this.mode.timeout {
                this.timer.set(Some(tokio::time::sleep(timeout)));
            }
        }

        // The deadline only matters while queued. Re-check the grant under
        // the state lock before giving up: a grant that raced ahead of the
        // timer wins.
        if let Some(id) = *this.waiter {
            if let Some(timer) = this.timer.as_mut().as_pin_mut() {
                if timer.poll(context).is_ready() {
                    let (granted, next) = {
                        let mut state = this.lock.state.lock();
                        if state.is_granted(id) {
                            (true, None)
                        } else {
                            (false, state.remove_and_grant_next(id))
                        }
                    };
                    if let Some(waker) = next {
                        waker.wake();
                    }
                    *this.waiter = None;
                    *this.completed = true;
                    if granted {
                        trace!(waiter = id, "granted");
                        return Poll::Ready(Ok(LockGuard {
                            lock: *this.lock,
                            waiter: id,
                        }));
                    }
                    trace!(waiter = id, "timed out");
                    return Poll::Ready(Err(LockError::TimedOut));
                }
            }
        }

        Poll::Pending
    }
}

#[pinned_drop]
impl PinnedDrop for AcquireFuture<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        // An unresolved waiter leaves the queue; a granted-but-unobserved
        // waiter releases, passing the baton to the next in line.
        if let Some(id) = this.waiter.take() {
            trace!(waiter = id, "abandoned");
            this.lock.unlock(id);
        }
    }
}

/// The release capability for a held lock.
///
/// Bound to the specific waiter it was granted for, and single-use by
/// construction: [`release`](Self::release) consumes the guard, and dropping
/// it releases too, so a second release is unrepresentable.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a Lock,
    waiter: u64,
}

impl LockGuard<'_> {
    /// Releases the lock, granting the next waiter if one is queued.
    ///
    /// Equivalent to dropping the guard; provided for call sites where the
    /// release should be visible.
    pub fn release(self) {}
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        trace!(waiter = self.waiter, "released");
        self.lock.unlock(self.waiter);
    }
}

/// An owned release capability, returned by [`Lock::acquire_owned`].
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct OwnedLockGuard {
    lock: Arc<Lock>,
    waiter: u64,
}

impl OwnedLockGuard {
    /// Releases the lock, granting the next waiter if one is queued.
    pub fn release(self) {}
}

impl Drop for OwnedLockGuard {
    fn drop(&mut self) {
        trace!(waiter = self.waiter, "released");
        self.lock.unlock(self.waiter);
    }
}
