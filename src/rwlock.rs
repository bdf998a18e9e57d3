//! Interruptible readers-writer lock.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::block::{Block, BlockRef};
use crate::Interrupted;

/// A readers-writer lock owning its protected value, wired into the
/// for-ages registry.
///
/// Any number of readers or a single writer may hold the lock. Readers and
/// writers share one breaker, so an `end` reaches blocked threads on either
/// side. Readers do not queue behind waiting writers; writer progress is
/// bounded only by read traffic.
pub struct RwLock<T: ?Sized> {
    block: Block,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Create an unlocked lock holding `value`.
    pub fn new(value: T) -> RwLock<T> {
        RwLock {
            block: Block::new_rwlock(),
            value: UnsafeCell::new(value),
        }
    }

    /// Consume the lock and return its value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquire shared read access, blocking until no writer holds the lock.
    /// Fails with [`Interrupted`] once the thread has been asked to end.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, T>, Interrupted> {
        let raw = self.block.data().rwlock();
        self.block
            .acquire_interruptibly(&|budget| raw.try_read_for(budget), &|| raw.unlock_read())?;
        Ok(self.read_guard())
    }

    /// Shared read access without blocking.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        if self.block.data().rwlock().try_read() {
            Some(self.read_guard())
        } else {
            None
        }
    }

    /// Shared read access with a total-elapsed budget; `Ok(None)` on
    /// timeout.
    pub fn try_read_for(
        &self,
        timeout: Duration,
    ) -> Result<Option<RwLockReadGuard<'_, T>>, Interrupted> {
        let raw = self.block.data().rwlock();
        let acquired = self.block.acquire_interruptibly_for(
            timeout,
            &|budget| raw.try_read_for(budget),
            &|| raw.unlock_read(),
        )?;
        Ok(if acquired {
            Some(self.read_guard())
        } else {
            None
        })
    }

    /// Acquire exclusive write access, blocking until the lock is free.
    /// Fails with [`Interrupted`] once the thread has been asked to end.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, T>, Interrupted> {
        let raw = self.block.data().rwlock();
        self.block
            .acquire_interruptibly(&|budget| raw.try_write_for(budget), &|| raw.unlock_write())?;
        Ok(self.write_guard())
    }

    /// Exclusive write access without blocking.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        if self.block.data().rwlock().try_write() {
            Some(self.write_guard())
        } else {
            None
        }
    }

    /// Exclusive write access with a total-elapsed budget; `Ok(None)` on
    /// timeout.
    pub fn try_write_for(
        &self,
        timeout: Duration,
    ) -> Result<Option<RwLockWriteGuard<'_, T>>, Interrupted> {
        let raw = self.block.data().rwlock();
        let acquired = self.block.acquire_interruptibly_for(
            timeout,
            &|budget| raw.try_write_for(budget),
            &|| raw.unlock_write(),
        )?;
        Ok(if acquired {
            Some(self.write_guard())
        } else {
            None
        })
    }

    /// Mutable access without locking; the exclusive borrow is proof enough.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.value.get() }
    }

    /// Weak observer handle for this lock's block.
    pub fn block_ref(&self) -> BlockRef {
        self.block.downgrade()
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, T> {
        RwLockReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, T> {
        RwLockWriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn unlock_read_raw(&self) {
        self.block.data().rwlock().unlock_read();
        self.block.breaker().wake_all();
    }

    pub(crate) fn lock_read_raw(&self) {
        self.block.data().rwlock().lock_read();
    }

    pub(crate) fn unlock_write_raw(&self) {
        self.block.data().rwlock().unlock_write();
        self.block.breaker().wake_all();
    }

    pub(crate) fn lock_write_raw(&self) {
        self.block.data().rwlock().lock_write();
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> RwLock<T> {
        RwLock::new(T::default())
    }
}

impl<T> From<T> for RwLock<T> {
    fn from(value: T) -> RwLock<T> {
        RwLock::new(value)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RwLock");
        match self.try_read() {
            Some(guard) => d.field("value", &&*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// Shared-access RAII guard for an [`RwLock`].
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<'a, T: ?Sized + Sync> Sync for RwLockReadGuard<'a, T> {}

impl<'a, T: ?Sized> RwLockReadGuard<'a, T> {
    pub(crate) fn rwlock(&self) -> &'a RwLock<T> {
        self.lock
    }
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock_read_raw();
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for RwLockReadGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Exclusive-access RAII guard for an [`RwLock`].
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<'a, T: ?Sized + Sync> Sync for RwLockWriteGuard<'a, T> {}

impl<'a, T: ?Sized> RwLockWriteGuard<'a, T> {
    pub(crate) fn rwlock(&self) -> &'a RwLock<T> {
        self.lock
    }
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock_write_raw();
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for RwLockWriteGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
