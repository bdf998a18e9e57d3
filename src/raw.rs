//! Uninstrumented native primitives.
//!
//! Everything here is built from `std::sync::{Condvar, Mutex}` so that every
//! acquisition has a timed form. The instrumented blocks in the sibling
//! modules wrap these with registry bookkeeping; nothing in this module ever
//! touches the registry.
//!
//! Lock poisoning is treated as a programming bug: the internal locks are
//! only ever held across a few loads and stores, so a poisoned one means the
//! process is already unwinding from corrupted state.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::timer::Timer;

/// How a native condition wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Woken,
    TimedOut,
}

/// Mutual exclusion with timed acquisition.
pub(crate) struct RawMutex {
    held: Mutex<bool>,
    cv: Condvar,
}

impl RawMutex {
    pub(crate) fn new() -> RawMutex {
        RawMutex {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn try_lock(&self) -> bool {
        let mut held = self.held.lock().unwrap();
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    /// Acquire, giving up once `timeout` has elapsed.
    pub(crate) fn try_lock_for(&self, timeout: Duration) -> bool {
        let timer = Timer::start();
        let mut held = self.held.lock().unwrap();
        while *held {
            let remaining = timer.remaining(timeout);
            if remaining.is_zero() {
                return false;
            }
            held = self.cv.wait_timeout(held, remaining).unwrap().0;
        }
        *held = true;
        true
    }

    /// Acquire unconditionally. Used to re-take a lock that was released for
    /// a condition wait; must not fail, so it never consults interruption.
    pub(crate) fn lock(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cv.wait(held).unwrap();
        }
        *held = true;
    }

    pub(crate) fn unlock(&self) {
        let mut held = self.held.lock().unwrap();
        debug_assert!(*held, "unlock of an unheld RawMutex");
        *held = false;
        drop(held);
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct RwState {
    readers: usize,
    writer: bool,
}

/// Readers-writer lock with timed acquisition.
///
/// Readers do not queue behind waiting writers; writer progress is bounded
/// only by read traffic.
pub(crate) struct RawRwLock {
    state: Mutex<RwState>,
    cv: Condvar,
}

impl RawRwLock {
    pub(crate) fn new() -> RawRwLock {
        RawRwLock {
            state: Mutex::new(RwState::default()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn try_read(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer {
            false
        } else {
            state.readers += 1;
            true
        }
    }

    pub(crate) fn try_read_for(&self, timeout: Duration) -> bool {
        let timer = Timer::start();
        let mut state = self.state.lock().unwrap();
        while state.writer {
            let remaining = timer.remaining(timeout);
            if remaining.is_zero() {
                return false;
            }
            state = self.cv.wait_timeout(state, remaining).unwrap().0;
        }
        state.readers += 1;
        true
    }

    /// Unconditional read acquisition, for re-taking after a condition wait.
    pub(crate) fn lock_read(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer {
            state = self.cv.wait(state).unwrap();
        }
        state.readers += 1;
    }

    pub(crate) fn try_write(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.readers > 0 {
            false
        } else {
            state.writer = true;
            true
        }
    }

    pub(crate) fn try_write_for(&self, timeout: Duration) -> bool {
        let timer = Timer::start();
        let mut state = self.state.lock().unwrap();
        while state.writer || state.readers > 0 {
            let remaining = timer.remaining(timeout);
            if remaining.is_zero() {
                return false;
            }
            state = self.cv.wait_timeout(state, remaining).unwrap().0;
        }
        state.writer = true;
        true
    }

    /// Unconditional write acquisition, for re-taking after a condition wait.
    pub(crate) fn lock_write(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.readers > 0 {
            state = self.cv.wait(state).unwrap();
        }
        state.writer = true;
    }

    pub(crate) fn unlock_read(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.readers > 0, "read-unlock of an unheld RawRwLock");
        state.readers -= 1;
        let none_left = state.readers == 0;
        drop(state);
        if none_left {
            self.cv.notify_all();
        }
    }

    pub(crate) fn unlock_write(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.writer, "write-unlock of an unheld RawRwLock");
        state.writer = false;
        drop(state);
        self.cv.notify_all();
    }
}

/// Counting semaphore with timed multi-permit acquisition.
pub(crate) struct RawSemaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl RawSemaphore {
    pub(crate) fn new(permits: usize) -> RawSemaphore {
        RawSemaphore {
            permits: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn available(&self) -> usize {
        *self.permits.lock().unwrap()
    }

    pub(crate) fn try_acquire(&self, n: usize) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits >= n {
            *permits -= n;
            true
        } else {
            false
        }
    }

    pub(crate) fn try_acquire_for(&self, n: usize, timeout: Duration) -> bool {
        let timer = Timer::start();
        let mut permits = self.permits.lock().unwrap();
        while *permits < n {
            let remaining = timer.remaining(timeout);
            if remaining.is_zero() {
                return false;
            }
            permits = self.cv.wait_timeout(permits, remaining).unwrap().0;
        }
        *permits -= n;
        true
    }

    pub(crate) fn release(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        drop(permits);
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct CondState {
    waiters: usize,
    wakeups: usize,
}

/// Condition variable with counted wakeups.
///
/// `std::sync::Condvar` wakes spuriously and cannot atomically release an
/// unrelated lock, so waiters and pending wakeups are counted explicitly: a
/// wakeup is only reported to a thread that was already waiting when
/// [`RawCond::wake_all`] ran, and the release closure passed to
/// [`RawCond::wait_then`] runs under the internal lock, after the caller is
/// registered as a waiter. A wake issued by whoever takes the released lock
/// next therefore cannot be missed.
pub(crate) struct RawCond {
    state: Mutex<CondState>,
    cv: Condvar,
}

impl RawCond {
    pub(crate) fn new() -> RawCond {
        RawCond {
            state: Mutex::new(CondState::default()),
            cv: Condvar::new(),
        }
    }

    /// Register as a waiter, run `release`, then sleep until woken or until
    /// `timeout` (if any) expires.
    pub(crate) fn wait_then<F: FnOnce()>(&self, release: F, timeout: Option<Duration>) -> WaitOutcome {
        let timer = Timer::start();
        let mut state = self.state.lock().unwrap();
        state.waiters += 1;
        release();
        loop {
            if state.wakeups > 0 {
                state.wakeups -= 1;
                state.waiters -= 1;
                return WaitOutcome::Woken;
            }
            match timeout {
                Some(budget) => {
                    let remaining = timer.remaining(budget);
                    if remaining.is_zero() {
                        state.waiters -= 1;
                        // Pending wakeups are addressed to current waiters only.
                        if state.wakeups > state.waiters {
                            state.wakeups = state.waiters;
                        }
                        return WaitOutcome::TimedOut;
                    }
                    state = self.cv.wait_timeout(state, remaining).unwrap().0;
                }
                None => state = self.cv.wait(state).unwrap(),
            }
        }
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_then(|| {}, timeout)
    }

    /// Wake every thread currently waiting.
    pub(crate) fn wake_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.wakeups = state.waiters;
        drop(state);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutex_try_lock() {
        let raw = RawMutex::new();
        assert!(raw.try_lock());
        assert!(!raw.try_lock());
        raw.unlock();
        assert!(raw.try_lock());
        raw.unlock();
    }

    #[test]
    fn mutex_timed_lock_times_out() {
        let raw = RawMutex::new();
        assert!(raw.try_lock());
        let timer = Timer::start();
        assert!(!raw.try_lock_for(Duration::from_millis(50)));
        assert!(timer.elapsed() >= Duration::from_millis(50));
        raw.unlock();
    }

    #[test]
    fn mutex_timed_lock_succeeds_on_unlock() {
        let raw = Arc::new(RawMutex::new());
        assert!(raw.try_lock());
        let contender = {
            let raw = Arc::clone(&raw);
            thread::spawn(move || raw.try_lock_for(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        raw.unlock();
        assert!(contender.join().unwrap());
        raw.unlock();
    }

    #[test]
    fn rwlock_readers_share_writers_exclude() {
        let raw = RawRwLock::new();
        assert!(raw.try_read());
        assert!(raw.try_read());
        assert!(!raw.try_write());
        raw.unlock_read();
        assert!(!raw.try_write());
        raw.unlock_read();
        assert!(raw.try_write());
        assert!(!raw.try_read());
        raw.unlock_write();
    }

    #[test]
    fn semaphore_counts_permits() {
        let raw = RawSemaphore::new(3);
        assert_eq!(raw.available(), 3);
        assert!(raw.try_acquire(2));
        assert_eq!(raw.available(), 1);
        assert!(!raw.try_acquire(2));
        raw.release(1);
        assert!(raw.try_acquire(2));
        assert_eq!(raw.available(), 0);
        raw.release(3);
    }

    #[test]
    fn cond_timed_wait_times_out() {
        let raw = RawCond::new();
        let timer = Timer::start();
        let outcome = raw.wait(Some(Duration::from_millis(50)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(timer.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn cond_wake_before_wait_is_not_stored() {
        let raw = RawCond::new();
        raw.wake_all();
        let outcome = raw.wait(Some(Duration::from_millis(20)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn cond_wake_all_reaches_current_waiters() {
        let raw = Arc::new(RawCond::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let raw = Arc::clone(&raw);
                thread::spawn(move || raw.wait(Some(Duration::from_secs(5))))
            })
            .collect();
        thread::sleep(Duration::from_millis(100));
        raw.wake_all();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), WaitOutcome::Woken);
        }
    }
}
