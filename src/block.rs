//! Shared block state and handles.
//!
//! Every interruptible primitive is a *block*: shared state holding the
//! native primitive plus the breaker used to kick waiters out of a native
//! sleep. Primitives own their state through [`Block`] handles; the registry
//! observes it only through [`BlockRef`] weak handles, so tracking a block
//! never extends its lifetime. An expired `BlockRef` answers every request
//! with "do nothing".

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::cond::WaitCondition;
use crate::raw::{RawCond, RawMutex, RawRwLock, RawSemaphore};
use crate::registry;
use crate::semaphore::Semaphore;
use crate::timer::Timer;
use crate::{Interrupted, InvalidCast};

/// Native waits and breaker sleeps are chopped into slices of this length,
/// so a blocked thread re-checks interruption at least this often.
pub(crate) const WAIT_QUANTUM: Duration = Duration::from_millis(200);

/// Which concrete primitive a block is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// A [`Mutex`](crate::Mutex).
    Mutex,
    /// An [`RwLock`](crate::RwLock).
    RwLock,
    /// A [`Semaphore`](crate::Semaphore).
    Semaphore,
    /// A [`WaitCondition`](crate::WaitCondition).
    WaitCondition,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockKind::Mutex => "Mutex",
            BlockKind::RwLock => "RwLock",
            BlockKind::Semaphore => "Semaphore",
            BlockKind::WaitCondition => "WaitCondition",
        };
        f.write_str(name)
    }
}

/// The native side of one concrete primitive.
pub(crate) enum Inner {
    Mutex(RawMutex),
    RwLock(RawRwLock),
    Semaphore(RawSemaphore),
    Cond(RawCond),
}

/// State shared by every handle to one primitive.
pub(crate) struct BlockData {
    inner: Inner,
    breaker: Breaker,
}

impl BlockData {
    fn new(inner: Inner) -> BlockData {
        BlockData {
            inner,
            breaker: Breaker::new(),
        }
    }

    pub(crate) fn kind(&self) -> BlockKind {
        match self.inner {
            Inner::Mutex(_) => BlockKind::Mutex,
            Inner::RwLock(_) => BlockKind::RwLock,
            Inner::Semaphore(_) => BlockKind::Semaphore,
            Inner::Cond(_) => BlockKind::WaitCondition,
        }
    }

    pub(crate) fn mutex(&self) -> &RawMutex {
        match &self.inner {
            Inner::Mutex(raw) => raw,
            _ => unreachable!("block is not a mutex"),
        }
    }

    pub(crate) fn rwlock(&self) -> &RawRwLock {
        match &self.inner {
            Inner::RwLock(raw) => raw,
            _ => unreachable!("block is not an rwlock"),
        }
    }

    pub(crate) fn semaphore(&self) -> &RawSemaphore {
        match &self.inner {
            Inner::Semaphore(raw) => raw,
            _ => unreachable!("block is not a semaphore"),
        }
    }

    pub(crate) fn cond(&self) -> &RawCond {
        match &self.inner {
            Inner::Cond(raw) => raw,
            _ => unreachable!("block is not a wait condition"),
        }
    }

    /// Kick every waiter back to the top of its wait loop so it re-checks
    /// for the end of for-ages. Lock and semaphore waiters sleep on the
    /// breaker in bounded slices; condition waiters sleep unbounded on the
    /// native condition itself and need a native wake too.
    pub(crate) fn interrupt_waiters(&self) {
        if let Inner::Cond(cond) = &self.inner {
            cond.wake_all();
        }
        self.breaker.wake_all();
    }
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockData({})", self.kind())
    }
}

/// Breaker channel: a native (mutex, condition) pair living beside a block's
/// real waiting primitive. The registry wakes it to force threads out of a
/// native sleep so they re-check interruption.
pub(crate) struct Breaker {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Breaker {
    fn new() -> Breaker {
        Breaker {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Sleep until woken or until `timeout` passes. Sleeps are always
    /// bounded: a wake that lands between a failed native attempt and this
    /// sleep costs one timeout round, never a hang.
    pub(crate) fn wait(&self, timeout: Duration) {
        let guard = self.lock.lock().unwrap();
        let _ = self.cv.wait_timeout(guard, timeout).unwrap();
    }

    pub(crate) fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
    }
}

/// Owning shared handle to a block. Clones share the same state; equality is
/// identity of that state.
#[derive(Clone)]
pub(crate) struct Block {
    data: Arc<BlockData>,
}

impl Block {
    pub(crate) fn new_mutex() -> Block {
        Block::from_inner(Inner::Mutex(RawMutex::new()))
    }

    pub(crate) fn new_rwlock() -> Block {
        Block::from_inner(Inner::RwLock(RawRwLock::new()))
    }

    pub(crate) fn new_semaphore(permits: usize) -> Block {
        Block::from_inner(Inner::Semaphore(RawSemaphore::new(permits)))
    }

    pub(crate) fn new_cond() -> Block {
        Block::from_inner(Inner::Cond(RawCond::new()))
    }

    fn from_inner(inner: Inner) -> Block {
        Block {
            data: Arc::new(BlockData::new(inner)),
        }
    }

    #[inline]
    pub(crate) fn data(&self) -> &BlockData {
        &self.data
    }

    #[inline]
    pub(crate) fn kind(&self) -> BlockKind {
        self.data.kind()
    }

    #[inline]
    pub(crate) fn breaker(&self) -> &Breaker {
        &self.data.breaker
    }

    pub(crate) fn downgrade(&self) -> BlockRef {
        BlockRef {
            data: Arc::downgrade(&self.data),
        }
    }

    /// Short-budget-first acquisition shared by the locks and the semaphore:
    /// try natively for one quantum (uncontended acquisitions never touch
    /// the registry), then register as a waiter and alternate bounded native
    /// attempts with breaker sleeps and checkpoints until `attempt`
    /// succeeds or the thread is interrupted.
    pub(crate) fn acquire_interruptibly(
        &self,
        attempt: &dyn Fn(Duration) -> bool,
        undo: &dyn Fn(),
    ) -> Result<(), Interrupted> {
        if attempt(WAIT_QUANTUM) {
            return Ok(());
        }

        registry::about_to_sleep(self)?;
        let result = loop {
            if attempt(WAIT_QUANTUM) {
                break Ok(());
            }
            self.breaker().wait(WAIT_QUANTUM);
            if let Err(err) = registry::checkpoint() {
                break Err(err);
            }
        };
        self.finish_acquire(result.map(|()| true), undo).map(|_| ())
    }

    /// Timed flavour of [`Block::acquire_interruptibly`] with a total-elapsed
    /// budget. `Ok(false)` reports a timeout; budgets within one quantum go
    /// straight to the native layer.
    pub(crate) fn acquire_interruptibly_for(
        &self,
        timeout: Duration,
        attempt: &dyn Fn(Duration) -> bool,
        undo: &dyn Fn(),
    ) -> Result<bool, Interrupted> {
        if timeout <= WAIT_QUANTUM {
            return Ok(attempt(timeout));
        }

        registry::about_to_sleep(self)?;
        let timer = Timer::start();
        let result = loop {
            let remaining = timer.remaining(timeout);
            if remaining.is_zero() {
                break Ok(false);
            }
            if attempt(remaining.min(WAIT_QUANTUM)) {
                break Ok(true);
            }
            if let Err(err) = registry::checkpoint() {
                break Err(err);
            }
            let remaining = timer.remaining(timeout);
            if remaining.is_zero() {
                break Ok(false);
            }
            self.breaker().wait(remaining.min(WAIT_QUANTUM));
            if let Err(err) = registry::checkpoint() {
                break Err(err);
            }
        };
        self.finish_acquire(result, undo)
    }

    /// Deregister after a wait. If interruption raced a successful
    /// acquisition, give the resource back before reporting the failure so
    /// nothing is left held by a thread that is unwinding.
    fn finish_acquire(
        &self,
        result: Result<bool, Interrupted>,
        undo: &dyn Fn(),
    ) -> Result<bool, Interrupted> {
        let woke = registry::has_woken(self);
        match (result, woke) {
            (Ok(acquired), Ok(())) => Ok(acquired),
            (Ok(true), Err(err)) => {
                undo();
                self.breaker().wake_all();
                Err(err)
            }
            (Ok(false), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        }
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Block) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:p})", self.kind(), Arc::as_ptr(&self.data))
    }
}

/// Weak handle to a block, as held by the registry.
///
/// A `BlockRef` observes a block without keeping it alive: once the last
/// owning handle drops, the reference expires and every operation on it
/// becomes a no-op (or a cast failure). Obtained from a primitive's
/// `block_ref` method.
#[derive(Clone)]
pub struct BlockRef {
    data: Weak<BlockData>,
}

impl BlockRef {
    /// True once the referenced block has been destroyed.
    pub fn is_expired(&self) -> bool {
        self.data.strong_count() == 0
    }

    /// The kind of the referenced block, while it is still alive.
    pub fn kind(&self) -> Option<BlockKind> {
        self.data.upgrade().map(|data| data.kind())
    }

    /// Narrow this reference back to a [`Semaphore`] handle sharing the
    /// referenced block.
    pub fn as_semaphore(&self) -> Result<Semaphore, InvalidCast> {
        self.narrow(BlockKind::Semaphore).map(Semaphore::from_block)
    }

    /// Narrow this reference back to a [`WaitCondition`] handle sharing the
    /// referenced block.
    pub fn as_wait_condition(&self) -> Result<WaitCondition, InvalidCast> {
        self.narrow(BlockKind::WaitCondition)
            .map(WaitCondition::from_block)
    }

    fn narrow(&self, expected: BlockKind) -> Result<Block, InvalidCast> {
        match self.data.upgrade() {
            Some(data) if data.kind() == expected => Ok(Block { data }),
            Some(data) => Err(InvalidCast {
                expected,
                found: Some(data.kind()),
            }),
            None => Err(InvalidCast {
                expected,
                found: None,
            }),
        }
    }

    pub(crate) fn refers_to(&self, block: &Block) -> bool {
        match self.data.upgrade() {
            Some(data) => Arc::ptr_eq(&data, &block.data),
            None => false,
        }
    }

    /// Ask the referenced block to kick its waiters so they re-check for the
    /// end of for-ages. Does nothing once the block is gone; never fails.
    pub(crate) fn check_end_for_ages(&self) {
        if let Some(data) = self.data.upgrade() {
            data.interrupt_waiters();
        }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data.upgrade() {
            Some(data) => write!(f, "BlockRef({})", data.kind()),
            None => f.write_str("BlockRef(expired)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_compare_by_identity() {
        let a = Block::new_mutex();
        let b = a.clone();
        let c = Block::new_mutex();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn refs_expire_with_the_last_handle() {
        let block = Block::new_semaphore(1);
        let weak = block.downgrade();
        assert!(!weak.is_expired());
        assert_eq!(weak.kind(), Some(BlockKind::Semaphore));
        drop(block);
        assert!(weak.is_expired());
        assert_eq!(weak.kind(), None);
        // Waking an expired ref must be harmless.
        weak.check_end_for_ages();
    }

    #[test]
    fn narrowing_checks_the_kind() {
        let block = Block::new_cond();
        let weak = block.downgrade();
        assert!(weak.as_wait_condition().is_ok());
        let err = weak.as_semaphore().unwrap_err();
        assert_eq!(err.expected, BlockKind::Semaphore);
        assert_eq!(err.found, Some(BlockKind::WaitCondition));
        drop(block);
        assert_eq!(weak.as_wait_condition().unwrap_err().found, None);
    }

    #[test]
    fn breaker_wake_then_wait_times_out_quickly() {
        let block = Block::new_mutex();
        block.breaker().wake_all();
        let timer = Timer::start();
        block.breaker().wait(Duration::from_millis(20));
        assert!(timer.elapsed() < Duration::from_secs(2));
    }
}
