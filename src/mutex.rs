//! Interruptible mutual exclusion.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::block::{Block, BlockRef};
use crate::Interrupted;

/// A mutual-exclusion lock owning its protected value, wired into the
/// for-ages registry.
///
/// [`Mutex::lock`] can be broken out of by `end`/`end_thread`, and a
/// registered thread stuck behind a long-held lock honours pause and end at
/// every 200 ms slice of its wait. Uncontended acquisitions never touch the
/// registry.
///
/// Locking returns a guard; dropping the guard unlocks. Poisoning is not
/// tracked: a panic while holding the lock simply unlocks it.
pub struct Mutex<T: ?Sized> {
    block: Block,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create an unlocked mutex holding `value`.
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            block: Block::new_mutex(),
            value: UnsafeCell::new(value),
        }
    }

    /// Consume the mutex and return its value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock, blocking until it is available.
    ///
    /// Fails with [`Interrupted`] once this thread (or the whole program)
    /// has been asked to end; an interrupted thread never starts a
    /// registered sleep.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>, Interrupted> {
        let raw = self.block.data().mutex();
        self.block
            .acquire_interruptibly(&|budget| raw.try_lock_for(budget), &|| raw.unlock())?;
        Ok(self.guard())
    }

    /// Acquire without blocking. Never consults the registry, so it succeeds
    /// or fails immediately even on an interrupted thread.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.block.data().mutex().try_lock() {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Acquire with a total-elapsed budget. `Ok(None)` reports a timeout;
    /// timeouts are never errors. Interruption during the wait fails the
    /// call rather than timing it out.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<Option<MutexGuard<'_, T>>, Interrupted> {
        let raw = self.block.data().mutex();
        let acquired = self.block.acquire_interruptibly_for(
            timeout,
            &|budget| raw.try_lock_for(budget),
            &|| raw.unlock(),
        )?;
        Ok(if acquired { Some(self.guard()) } else { None })
    }

    /// Mutable access without locking; the exclusive borrow is proof enough.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.value.get() }
    }

    /// Weak observer handle for this lock's block.
    pub fn block_ref(&self) -> BlockRef {
        self.block.downgrade()
    }

    fn guard(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn unlock_raw(&self) {
        self.block.data().mutex().unlock();
        self.block.breaker().wake_all();
    }

    pub(crate) fn lock_raw(&self) {
        self.block.data().mutex().lock();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(value: T) -> Mutex<T> {
        Mutex::new(value)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => d.field("value", &&*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// RAII guard for a [`Mutex`]; the lock is released on drop and the breaker
/// is woken so blocked lockers re-contend.
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
    /// Guards stay on the locking thread, like std's.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<'a, T: ?Sized + Sync> Sync for MutexGuard<'a, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.lock
    }
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock_raw();
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}
