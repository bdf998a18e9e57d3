//! Interruptible counting semaphore.

use std::fmt;
use std::time::Duration;

use crate::block::{Block, BlockRef};
use crate::Interrupted;

/// Counting semaphore wired into the for-ages registry. Clones are handles
/// to the same semaphore.
///
/// Permits are acquired and released explicitly; nothing ties a permit to
/// the thread that took it, so one thread may acquire and another release.
#[derive(Clone)]
pub struct Semaphore {
    block: Block,
}

impl Semaphore {
    /// Create a semaphore holding `permits` permits.
    pub fn new(permits: usize) -> Semaphore {
        Semaphore {
            block: Block::new_semaphore(permits),
        }
    }

    pub(crate) fn from_block(block: Block) -> Semaphore {
        Semaphore { block }
    }

    fn raw(&self) -> &crate::raw::RawSemaphore {
        self.block.data().semaphore()
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.raw().available()
    }

    /// Take `permits` permits, blocking until enough are available. Fails
    /// with [`Interrupted`] once the thread has been asked to end.
    pub fn acquire(&self, permits: usize) -> Result<(), Interrupted> {
        self.block.acquire_interruptibly(
            &|budget| self.raw().try_acquire_for(permits, budget),
            &|| self.raw().release(permits),
        )
    }

    /// Take `permits` permits without blocking; reports whether it did.
    pub fn try_acquire(&self, permits: usize) -> bool {
        self.raw().try_acquire(permits)
    }

    /// Take `permits` permits with a total-elapsed budget; `Ok(false)` on
    /// timeout. A zero budget behaves exactly like [`Semaphore::try_acquire`].
    pub fn try_acquire_for(&self, permits: usize, timeout: Duration) -> Result<bool, Interrupted> {
        self.block.acquire_interruptibly_for(
            timeout,
            &|budget| self.raw().try_acquire_for(permits, budget),
            &|| self.raw().release(permits),
        )
    }

    /// Return `permits` permits and wake blocked acquirers so they
    /// re-contend.
    pub fn release(&self, permits: usize) {
        self.raw().release(permits);
        self.block.breaker().wake_all();
    }

    /// Weak observer handle for this semaphore's block.
    pub fn block_ref(&self) -> BlockRef {
        self.block.downgrade()
    }
}

impl PartialEq for Semaphore {
    /// Handle identity: clones of one semaphore are equal.
    fn eq(&self, other: &Semaphore) -> bool {
        self.block == other.block
    }
}

impl Eq for Semaphore {}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .finish()
    }
}
