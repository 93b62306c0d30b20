//! Fair asynchronous mutual exclusion.
//!
//! `fairlock` provides [`Lock`], an async lock that grants exclusive access
//! one requester at a time, in strict arrival (FIFO) order. Acquisition has
//! two independent knobs, combined in [`AcquireMode`]:
//!
//! - **blocking** (default): wait until the entries ahead release. With
//!   [`AcquireMode::non_blocking`], fail immediately with
//!   [`LockError::Held`] instead of queueing.
//! - **timeout**: bound the wait with [`AcquireMode::timeout`]; if the grant
//!   has not arrived by the deadline, the waiter is removed from the queue
//!   and the acquisition fails with [`LockError::TimedOut`]. The deadline
//!   only applies while queued, never while holding.
//!
//! A successful acquisition yields a [`LockGuard`] (or [`OwnedLockGuard`]):
//! a single-use release capability bound to the waiter it was granted for.
//! Releasing — explicitly via [`LockGuard::release`] or by dropping the
//! guard — advances the queue and grants the next waiter.
//!
//! [`Lock::run_exclusive`] composes acquire, a unit of work, and guaranteed
//! release into one call: the lock is released on every exit path of the
//! work, including panics and cancellation, and the work's output is passed
//! through unchanged.
//!
//! # Example
//!
//! ```
//! use fairlock::{AcquireMode, Lock};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let lock = Lock::new();
//!
//! let value = lock.run_exclusive(|| async { 42 }).await.expect("uncontended");
//! assert_eq!(value, 42);
//!
//! // Bounded wait: gives up if the holder does not release in time.
//! let mode = AcquireMode::new().timeout(Duration::from_millis(100));
//! let guard = lock.acquire_with(mode).await.expect("lock is free");
//! assert!(lock.is_locked());
//! guard.release();
//! # }
//! ```
//!
//! # Scheduling model
//!
//! The lock orders access for cooperatively scheduled tasks; every queue
//! transition (enqueue, grant, release, timeout removal) completes under an
//! internal mutex, so transitions never interleave. Timers come from the
//! runtime's clock ([`tokio::time`]); everything else is executor-agnostic.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod lock;

pub use error::LockError;
pub use lock::{AcquireFuture, AcquireMode, Lock, LockGuard, OwnedLockGuard};
