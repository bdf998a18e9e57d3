//! Wait conditions over the interruptible locks.

use std::fmt;
use std::time::Duration;

use crate::block::{Block, BlockRef, WAIT_QUANTUM};
use crate::mutex::MutexGuard;
use crate::raw::WaitOutcome;
use crate::registry;
use crate::rwlock::{RwLockReadGuard, RwLockWriteGuard};
use crate::timer::Timer;
use crate::Interrupted;

mod sealed {
    /// Internal face of a releasable lock guard. Lives in a private module
    /// so the public trait stays sealed; only the crate's own guards
    /// implement it.
    pub trait Sealed {
        /// Give the lock up for the duration of a wait. Wakes the lock's
        /// breaker exactly as a real unlock does, so blocked lockers
        /// re-contend promptly.
        fn release(&self);
        /// Take the lock back. Must not fail: reacquisition ignores
        /// interruption so the guard is valid again before the wait
        /// reports anything.
        fn reacquire(&self);
    }
}

/// A lock guard that a [`WaitCondition`] can release and re-take around a
/// wait: the guards of [`Mutex`](crate::Mutex) and [`RwLock`](crate::RwLock)
/// (either side). Sealed; not implementable outside this crate.
pub trait LockGuard: sealed::Sealed {}

impl<'a, T: ?Sized> sealed::Sealed for MutexGuard<'a, T> {
    fn release(&self) {
        self.mutex().unlock_raw();
    }

    fn reacquire(&self) {
        self.mutex().lock_raw();
    }
}

impl<'a, T: ?Sized> LockGuard for MutexGuard<'a, T> {}

impl<'a, T: ?Sized> sealed::Sealed for RwLockReadGuard<'a, T> {
    fn release(&self) {
        self.rwlock().unlock_read_raw();
    }

    fn reacquire(&self) {
        self.rwlock().lock_read_raw();
    }
}

impl<'a, T: ?Sized> LockGuard for RwLockReadGuard<'a, T> {}

impl<'a, T: ?Sized> sealed::Sealed for RwLockWriteGuard<'a, T> {
    fn release(&self) {
        self.rwlock().unlock_write_raw();
    }

    fn reacquire(&self) {
        self.rwlock().lock_write_raw();
    }
}

impl<'a, T: ?Sized> LockGuard for RwLockWriteGuard<'a, T> {}

/// Condition variable cooperating with the for-ages registry.
///
/// Waiting releases the caller's lock for the duration of the wait,
/// atomically with respect to wakes, and re-takes it before returning.
/// That holds on the interruption path too, where the returned error means
/// the guard was dropped and the lock is back to a consistent, unheld state.
///
/// [`WaitCondition::wake_one`] narrows to a single *registered* waiter
/// through the registry even though the native wake is a broadcast;
/// unregistered waiters treat any native wake as logical, and a waiter in
/// the first 200 ms of an uncontended wait has not entered the registry yet.
///
/// Clones are handles to the same condition.
#[derive(Clone)]
pub struct WaitCondition {
    block: Block,
}

impl WaitCondition {
    /// Create a condition nobody is waiting on.
    pub fn new() -> WaitCondition {
        WaitCondition {
            block: Block::new_cond(),
        }
    }

    pub(crate) fn from_block(block: Block) -> WaitCondition {
        WaitCondition { block }
    }

    fn raw(&self) -> &crate::raw::RawCond {
        self.block.data().cond()
    }

    /// Release `guard`'s lock and sleep until a wake selects this thread,
    /// then re-take the lock and hand the guard back.
    ///
    /// Fails with [`Interrupted`] once the thread has been asked to end.
    pub fn wait<G: LockGuard>(&self, guard: G) -> Result<G, Interrupted> {
        self.wait_inner(Some(&guard), None)?;
        Ok(guard)
    }

    /// Timed [`WaitCondition::wait`]; the boolean is false when the budget
    /// elapsed without a logical wake. Interruption during the wait fails
    /// the call rather than timing it out.
    pub fn wait_timeout<G: LockGuard>(
        &self,
        guard: G,
        timeout: Duration,
    ) -> Result<(G, bool), Interrupted> {
        let woken = self.wait_inner(Some(&guard), Some(timeout))?;
        Ok((guard, woken))
    }

    /// Wait without a lock until a wake selects this thread.
    pub fn wait_forever(&self) -> Result<(), Interrupted> {
        self.wait_inner(None, None).map(|_| ())
    }

    /// Wait without a lock for up to `timeout`; `Ok(false)` on timeout.
    /// This is what [`sleep`](crate::sleep) is built on.
    pub fn wait_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.wait_inner(None, Some(timeout))
    }

    /// Allow a single waiting thread to wake. The native wake is a
    /// broadcast, since the OS primitive does not know which waiter the
    /// registry will pick; the registry flag is what lets exactly one
    /// registered waiter through; the rest go back to sleep.
    ///
    /// As with any condition variable, hold the lock the waiters paired
    /// with this condition while waking; a wake issued without it can slip
    /// past a waiter that is just re-taking the lock between two sleeps.
    pub fn wake_one(&self) {
        registry::set_should_wake_one(&self.block);
        self.raw().wake_all();
    }

    /// Wake every thread waiting on this condition.
    pub fn wake_all(&self) {
        registry::set_should_wake_all(&self.block);
        self.raw().wake_all();
    }

    /// Weak observer handle for this condition's block.
    pub fn block_ref(&self) -> BlockRef {
        self.block.downgrade()
    }

    fn wait_inner(
        &self,
        lock: Option<&dyn sealed::Sealed>,
        timeout: Option<Duration>,
    ) -> Result<bool, Interrupted> {
        let timer = Timer::start();

        // Budgets within one quantum never touch the registry.
        if let Some(budget) = timeout {
            if budget <= WAIT_QUANTUM {
                return Ok(self.native_wait(lock, Some(budget)) == WaitOutcome::Woken);
            }
        }

        // One short native wait first, so an uncontended quick wake stays
        // out of the registry too.
        if self.native_wait(lock, Some(WAIT_QUANTUM)) == WaitOutcome::Woken {
            return Ok(true);
        }

        registry::about_to_sleep(&self.block)?;
        // For a registered thread the registry's wake flag is authoritative;
        // for an unregistered one `should_wake` is a free pass and only the
        // native outcome can distinguish a wake from a timeout.
        let registered = registry::this_thread_id().is_some();
        let result = loop {
            // A bare wait has no lock serializing it against wakers, so it
            // polls in quantum slices instead of trusting a single long
            // native sleep.
            let slice = match timeout {
                Some(budget) => {
                    let remaining = timer.remaining(budget);
                    if remaining.is_zero() {
                        break Ok(false);
                    }
                    if lock.is_none() {
                        Some(remaining.min(WAIT_QUANTUM))
                    } else {
                        Some(remaining)
                    }
                }
                None if lock.is_none() => Some(WAIT_QUANTUM),
                None => None,
            };
            let outcome = self.native_wait(lock, slice);
            match registry::should_wake(&self.block) {
                Err(err) => break Err(err),
                Ok(false) => {}
                Ok(true) if registered || outcome == WaitOutcome::Woken => break Ok(true),
                // An unregistered thread whose native wait merely timed out:
                // the budget check above decides, or the wait goes on.
                Ok(true) => {}
            }
        };
        let woke = registry::has_woken(&self.block);
        match (result, woke) {
            (Ok(woken), Ok(())) => Ok(woken),
            (Ok(_), Err(err)) | (Err(err), _) => Err(err),
        }
    }

    /// One native wait: release the caller's lock (if any) atomically with
    /// entering the wait, sleep, re-take the lock.
    fn native_wait(
        &self,
        lock: Option<&dyn sealed::Sealed>,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        match lock {
            Some(lock) => {
                let outcome = self.raw().wait_then(|| lock.release(), timeout);
                lock.reacquire();
                outcome
            }
            None => self.raw().wait(timeout),
        }
    }
}

impl Default for WaitCondition {
    fn default() -> WaitCondition {
        WaitCondition::new()
    }
}

impl PartialEq for WaitCondition {
    /// Handle identity: clones of one condition are equal.
    fn eq(&self, other: &WaitCondition) -> bool {
        self.block == other.block
    }
}

impl Eq for WaitCondition {}

impl fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCondition").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mutex;

    #[test]
    fn short_timed_wait_times_out_natively() {
        let cond = WaitCondition::new();
        let timer = Timer::start();
        assert_eq!(cond.wait_for(Duration::from_millis(50)).unwrap(), false);
        assert!(timer.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn long_timed_wait_times_out() {
        let cond = WaitCondition::new();
        let timer = Timer::start();
        assert_eq!(cond.wait_for(Duration::from_millis(350)).unwrap(), false);
        let elapsed = timer.elapsed();
        assert!(elapsed >= Duration::from_millis(350));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn timed_wait_returns_the_guard_on_timeout() {
        let mutex = Mutex::new(41);
        let guard = mutex.lock().unwrap();
        let cond = WaitCondition::new();
        let (mut guard, woken) = cond
            .wait_timeout(guard, Duration::from_millis(50))
            .unwrap();
        assert!(!woken);
        *guard += 1;
        drop(guard);
        assert_eq!(*mutex.lock().unwrap(), 42);
    }
}
