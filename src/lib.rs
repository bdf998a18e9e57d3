//! Interruptible, pausable synchronization primitives over a process-wide
//! thread registry.
//!
//! "for-ages" is for computations that run for a long, indefinite time,
//! possibly forever, until asked to stop. Worker threads register with a
//! process-wide registry and then use the blocking primitives provided here
//! ([`Mutex`], [`RwLock`], [`Semaphore`], [`WaitCondition`]) plus cooperative
//! [`checkpoint`]s in their compute loops. An external controller can then,
//! at any moment:
//!
//! * **pause** one thread or all of them: each quiesces at its next
//!   checkpoint and sleeps on a pause gate until played again;
//! * **end** one thread or all of them, delivered as the [`Interrupted`]
//!   error out of whatever blocking call or checkpoint the thread reaches
//!   next, unwinding it cleanly out of any wait.
//!
//! Blocking never turns into a polling storm: a waiting thread sleeps on
//! native primitives and is kicked out of its sleep through a per-block
//! breaker channel only when there is something to re-check. Uncontended and
//! short waits stay out of the registry entirely.
//!
//! Termination is always cooperative. A thread that never blocks and never
//! checkpoints is never terminated; sprinkle [`checkpoint`] (or the loop
//! helpers [`proceed`]/[`proceed_every`]) through long computations.
//!
//! ```
//! use std::sync::Arc;
//!
//! let counter = Arc::new(for_ages::Mutex::new(0u64));
//!
//! let worker = {
//!     let counter = Arc::clone(&counter);
//!     for_ages::spawn(move || {
//!         while for_ages::proceed_every(64)? {
//!             *counter.lock()? += 1;
//!         }
//!         Ok(())
//!     })
//! };
//!
//! for_ages::msleep(50).unwrap();
//! assert!(for_ages::end_thread(worker.id().unwrap()));
//! assert_eq!(worker.join().unwrap(), Err(for_ages::Interrupted));
//! assert!(*counter.lock().unwrap() > 0);
//! ```
//!
//! Timed operations report timeouts as values (`None` / `false`), never as
//! errors; [`Interrupted`] is the only error blocking calls surface.
//! Invariant violations (waiting on two blocks at once, registering a
//! thread twice) are programming bugs and panic.

#![deny(missing_debug_implementations)]

use thiserror::Error;

mod block;
mod cond;
mod log;
mod mutex;
mod raw;
mod registry;
mod rwlock;
mod semaphore;
mod timer;

pub mod thread;

pub use crate::block::{BlockKind, BlockRef};
pub use crate::cond::{LockGuard, WaitCondition};
pub use crate::mutex::{Mutex, MutexGuard};
pub use crate::registry::{
    checkpoint, checkpoint_every, end, end_all, end_thread, fini, get_this_thread_name, init,
    msleep, pause, pause_all, pause_thread, play, play_all, play_thread, proceed, proceed_every,
    register_this_thread, set_this_thread_name, sleep, this_thread_id, unregister_this_thread,
    ThreadId,
};
pub use crate::rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use crate::semaphore::Semaphore;
pub use crate::thread::spawn;
pub use crate::timer::Timer;

/// The end of for-ages: this thread (or the whole program) was asked to end
/// while the call was blocking or checkpointing.
///
/// Surfaced by every blocking primitive operation and by the checkpoints.
/// Catch it at a task boundary, clean up, and let the thread exit; the
/// registry is already consistent when the error reaches you.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted: the end of for-ages was signalled for this thread")]
pub struct Interrupted;

/// Failed narrowing of a [`BlockRef`] back to a concrete primitive: the
/// reference is expired, or the block is of a different kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot cast a block reference to {expected} (found {found:?})")]
pub struct InvalidCast {
    /// The kind the cast asked for.
    pub expected: BlockKind,
    /// What the reference actually points at; `None` if it has expired.
    pub found: Option<BlockKind>,
}
