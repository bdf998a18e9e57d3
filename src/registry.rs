//! The process-wide thread registry and control plane.
//!
//! One [`Registry`] per process records every registered thread, the block
//! each of them is currently sleeping on, and the interrupt/pause state of
//! the whole program. The blocks call into it through the hook functions
//! ([`about_to_sleep`], [`should_wake`], [`has_woken`] and the wake markers);
//! controllers call the public pause/play/end surface; worker code calls
//! [`checkpoint`] and friends.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::block::{Block, BlockRef};
use crate::cond::WaitCondition;
use crate::log::{Event, Logger};
use crate::Interrupted;

/// Identifier handed out by [`register_this_thread`].
///
/// Ids come from a counter that only grows, so an id is never reused within
/// a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The raw numeric id.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control state for one registered thread.
pub(crate) struct ThreadState {
    id: ThreadId,
    name: Mutex<String>,

    /// Counter for `checkpoint_every`. Only the owning thread touches it;
    /// wrapping arithmetic keeps the modulo test cheap.
    counter: AtomicU32,

    /// The block this thread is currently recorded as sleeping on. Written
    /// only while the registry's state lock is held for writing.
    current: Mutex<Option<BlockRef>>,

    /// Flags polled from wait loops and written by the control plane, padded
    /// so one thread's checkpoint traffic stays off its neighbours' lines.
    flags: CachePadded<Flags>,
}

struct Flags {
    /// Set by the wake markers to turn a native wake into a logical one.
    wake_from_current: AtomicBool,
    interrupted: AtomicBool,
    paused: AtomicBool,
}

impl ThreadState {
    fn new(id: ThreadId) -> ThreadState {
        ThreadState {
            id,
            name: Mutex::new(String::new()),
            counter: AtomicU32::new(0),
            current: Mutex::new(None),
            flags: CachePadded::new(Flags {
                wake_from_current: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                paused: AtomicBool::new(false),
            }),
        }
    }
}

/// ////////////////////////////////////////////////////////////////////////
/// The global program state

enum GlobalState {
    Unstarted,
    Running(Arc<Registry>),
    Finished,
}

static THE_PROGRAM: RwLock<GlobalState> = RwLock::new(GlobalState::Unstarted);

/// The program state, created lazily on first use. `None` once [`fini`] has
/// run: the end of for-ages has arrived and nothing restarts it.
fn program() -> Option<Arc<Registry>> {
    {
        let state = THE_PROGRAM.read().unwrap();
        match &*state {
            GlobalState::Running(registry) => return Some(Arc::clone(registry)),
            GlobalState::Finished => return None,
            GlobalState::Unstarted => {}
        }
    }

    let mut state = THE_PROGRAM.write().unwrap();
    match &*state {
        GlobalState::Running(registry) => Some(Arc::clone(registry)),
        GlobalState::Finished => None,
        GlobalState::Unstarted => {
            let registry = Arc::new(Registry::new());
            *state = GlobalState::Running(Arc::clone(&registry));
            Some(registry)
        }
    }
}

/// Like [`program`], but never creates the state. Used on teardown paths
/// where lazily starting the subsystem would be absurd.
fn existing_program() -> Option<Arc<Registry>> {
    match &*THE_PROGRAM.read().unwrap() {
        GlobalState::Running(registry) => Some(Arc::clone(registry)),
        _ => None,
    }
}

/// Start the subsystem eagerly. Everything also starts lazily on first use;
/// this exists so process setup can pay the cost at a chosen moment.
pub fn init() {
    let _ = program();
}

/// Shut the subsystem down: interrupt every registered thread, wake every
/// sleeper and the pause gate, and flush the event log.
///
/// Callable from an at-exit handler; later calls (and every later control
/// operation) are no-ops, and any later attempt to sleep on a block fails
/// with [`Interrupted`].
pub fn fini() {
    let registry = {
        let mut state = THE_PROGRAM.write().unwrap();
        match &*state {
            GlobalState::Running(registry) => Arc::clone(registry),
            _ => {
                *state = GlobalState::Finished;
                return;
            }
        }
    };
    // Interrupt everything while the state is still reachable, so threads
    // woken here observe an ordinary end-of-for-ages; only then retire the
    // global.
    registry.shutdown();
    *THE_PROGRAM.write().unwrap() = GlobalState::Finished;
}

// The worker's slot is allocated on first registration and stays in
// thread-local storage until the thread exits, even if the thread
// unregisters first: unregistration only detaches the registry map entry,
// the flags live on with the thread. The drop guard detaches threads that
// never unregistered so the map cannot accumulate entries for dead threads.
thread_local! {
    static THREAD_STATE: ThreadSlot = ThreadSlot(RefCell::new(None));
}

struct ThreadSlot(RefCell<Option<Arc<ThreadState>>>);

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        if let Some(thread) = self.0.borrow_mut().take() {
            if let Some(registry) = existing_program() {
                registry.detach(&thread);
            }
        }
    }
}

/// The calling thread's state, if it is registered.
fn current() -> Option<Arc<ThreadState>> {
    THREAD_STATE
        .try_with(|slot| slot.0.borrow().clone())
        .ok()
        .flatten()
}

/// ////////////////////////////////////////////////////////////////////////
/// Registry

/// Process-wide bookkeeping: every registered thread, every block somebody
/// is sleeping on, and the interrupt/pause state of the program.
pub(crate) struct Registry {
    logger: Logger,

    /// Thread map, block/waiter table and the id counter.
    state: RwLock<RegistryState>,

    /// Global interrupt flag. Atomic so checkpoints stay lock-free; written
    /// only under the state write lock so the write orders with the block
    /// sweep that follows it.
    is_interrupted: AtomicBool,

    /// Pause gate. A separate lock from `state` so a paused thread sleeps
    /// holding no registry lock.
    pause: Mutex<()>,
    pause_gate: Condvar,
    /// Written only under `pause`.
    is_paused: AtomicBool,
}

struct RegistryState {
    threads: HashMap<ThreadId, Arc<ThreadState>>,

    /// Blocks with at least one recorded waiter and their waiter counts.
    /// Entries are weak; expired ones are pruned whenever a sweep or a
    /// record removal walks the table.
    blocks: Vec<(BlockRef, usize)>,

    last_id: u64,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            logger: Logger::new(),
            state: RwLock::new(RegistryState {
                threads: HashMap::new(),
                blocks: Vec::new(),
                last_id: 0,
            }),
            is_interrupted: AtomicBool::new(false),
            pause: Mutex::new(()),
            pause_gate: Condvar::new(),
            is_paused: AtomicBool::new(false),
        }
    }

    fn interrupted(&self, thread: &ThreadState) -> bool {
        self.is_interrupted.load(Ordering::SeqCst)
            || thread.flags.interrupted.load(Ordering::SeqCst)
    }

    fn paused(&self, thread: &ThreadState) -> bool {
        self.is_paused.load(Ordering::SeqCst) || thread.flags.paused.load(Ordering::SeqCst)
    }

    /// All pause-gate notifications happen with the pause lock held, so a
    /// checkpoint that is re-testing its flags under that lock cannot miss
    /// one.
    fn wake_pause_gate(&self) {
        let _guard = self.pause.lock().unwrap();
        self.pause_gate.notify_all();
    }

    /// Wake every tracked block's waiters and drop expired entries. The
    /// state write lock must be held.
    fn sweep_blocks(state: &mut RegistryState) {
        state.blocks.retain(|(weak, _)| {
            weak.check_end_for_ages();
            !weak.is_expired()
        });
    }

    fn detach(&self, thread: &ThreadState) {
        let mut state = self.state.write().unwrap();
        if state.threads.remove(&thread.id).is_none() {
            return;
        }
        drop(state);
        self.logger.log(|| Event::ThreadUnregistered { id: thread.id });

        // A detached thread can no longer be played; make sure nobody keeps
        // sleeping on its behalf.
        if thread.flags.paused.load(Ordering::SeqCst) && !self.is_paused.load(Ordering::SeqCst) {
            self.wake_pause_gate();
        }
    }

    /// Record `thread` as sleeping on `block` and bump the block's waiter
    /// count. Fails (and leaves no record) if interruption is already set.
    fn record_waiter(&self, thread: &ThreadState, block: &Block) -> Result<(), Interrupted> {
        let mut state = self.state.write().unwrap();

        {
            let mut current = thread.current.lock().unwrap();
            if let Some(existing) = current.as_ref() {
                panic!(
                    "thread {} cannot wait on two blocks at once: sleeping on {:?}, entering {:?}",
                    thread.id, existing, block
                );
            }
            *current = Some(block.downgrade());
        }
        thread.flags.wake_from_current.store(false, Ordering::SeqCst);

        match state
            .blocks
            .iter_mut()
            .find(|(weak, _)| weak.refers_to(block))
        {
            Some(entry) => entry.1 += 1,
            None => state.blocks.push((block.downgrade(), 1)),
        }
        self.logger.log(|| Event::WaiterRecorded {
            id: thread.id,
            kind: block.kind(),
        });

        if self.interrupted(thread) {
            self.clear_waiter(&mut state, thread, block);
            self.logger.log(|| Event::Interrupted { id: thread.id });
            return Err(Interrupted);
        }
        Ok(())
    }

    /// Remove `thread`'s waiter record, decrement the block's count and
    /// prune dead table entries. The state write lock must be held.
    fn clear_waiter(&self, state: &mut RegistryState, thread: &ThreadState, block: &Block) {
        *thread.current.lock().unwrap() = None;
        thread.flags.wake_from_current.store(false, Ordering::SeqCst);

        let mut cleared = false;
        state.blocks.retain_mut(|(weak, count)| {
            if weak.is_expired() {
                return false;
            }
            if !cleared && weak.refers_to(block) {
                cleared = true;
                *count -= 1;
                return *count > 0;
            }
            true
        });
        self.logger.log(|| Event::WaiterCleared {
            id: thread.id,
            kind: block.kind(),
        });
    }

    /// `has_woken`: unconditional cleanup on every exit from a wait.
    fn waiter_woke(&self, thread: &ThreadState, block: &Block) -> Result<(), Interrupted> {
        {
            let current = thread.current.lock().unwrap();
            match current.as_ref() {
                // The record was already cleared, by `should_wake` or by an
                // earlier pass of this function.
                None => return Ok(()),
                Some(recorded) if !recorded.refers_to(block) => panic!(
                    "thread {} woke from {:?} while recorded as sleeping on {:?}",
                    thread.id, block, recorded
                ),
                Some(_) => {}
            }
        }

        let mut state = self.state.write().unwrap();
        self.clear_waiter(&mut state, thread, block);
        drop(state);

        if self.interrupted(thread) {
            self.logger.log(|| Event::Interrupted { id: thread.id });
            return Err(Interrupted);
        }
        Ok(())
    }

    /// `should_wake`: decide whether a native wake was a logical one.
    fn consult_wake(&self, thread: &ThreadState, block: &Block) -> Result<bool, Interrupted> {
        {
            let current = thread.current.lock().unwrap();
            match current.as_ref() {
                None => return Ok(true),
                Some(recorded) if !recorded.refers_to(block) => panic!(
                    "thread {} woke from {:?} while recorded as sleeping on {:?}",
                    thread.id, block, recorded
                ),
                Some(_) => {}
            }
        }

        let interrupted = self.interrupted(thread);
        let wake = thread.flags.wake_from_current.load(Ordering::SeqCst);
        if !wake && !interrupted {
            return Ok(false);
        }

        let mut state = self.state.write().unwrap();
        self.clear_waiter(&mut state, thread, block);
        drop(state);

        if interrupted {
            self.logger.log(|| Event::Interrupted { id: thread.id });
            Err(Interrupted)
        } else {
            Ok(true)
        }
    }

    /// Mark waiters of `block` as logically woken: all of them, or the first
    /// that is not already owed a wake.
    fn mark_waiters(&self, block: &Block, all: bool) {
        let state = self.state.read().unwrap();
        let mut woken = 0usize;
        let mut target = None;
        for thread in state.threads.values() {
            let waiting = thread
                .current
                .lock()
                .unwrap()
                .as_ref()
                .map_or(false, |weak| weak.refers_to(block));
            if !waiting {
                continue;
            }
            if all {
                thread.flags.wake_from_current.store(true, Ordering::SeqCst);
                woken += 1;
            } else if !thread.flags.wake_from_current.swap(true, Ordering::SeqCst) {
                target = Some(thread.id);
                break;
            }
        }
        drop(state);

        if all {
            self.logger.log(|| Event::WakeAll {
                kind: block.kind(),
                woken,
            });
        } else {
            self.logger.log(|| Event::WakeOne {
                kind: block.kind(),
                target,
            });
        }
    }

    /// The checkpoint proper: fail if interrupted, park on the pause gate if
    /// paused, and loop until neither holds.
    fn test_thread(&self, thread: &ThreadState) -> Result<(), Interrupted> {
        loop {
            if self.interrupted(thread) {
                self.logger.log(|| Event::Interrupted { id: thread.id });
                return Err(Interrupted);
            }
            if !self.paused(thread) {
                return Ok(());
            }

            // Re-test under the pause lock: every wake of the gate happens
            // with that lock held, so a play or end that slipped in since
            // the dirty read above is either visible here or will notify
            // after we start waiting.
            let guard = self.pause.lock().unwrap();
            if self.paused(thread) && !self.interrupted(thread) {
                self.logger.log(|| Event::PausedAtGate { id: thread.id });
                let _guard = self.pause_gate.wait(guard).unwrap();
                self.logger.log(|| Event::WokeFromGate { id: thread.id });
            }
        }
    }

    fn set_global_pause(&self, pause: bool) -> bool {
        let _guard = self.pause.lock().unwrap();
        if self.is_paused.load(Ordering::SeqCst) == pause {
            return false;
        }
        self.is_paused.store(pause, Ordering::SeqCst);
        if !pause {
            self.pause_gate.notify_all();
        }
        true
    }

    fn shutdown(&self) {
        let mut state = self.state.write().unwrap();
        for thread in state.threads.values() {
            thread.flags.interrupted.store(true, Ordering::SeqCst);
        }
        self.is_interrupted.store(true, Ordering::SeqCst);
        Self::sweep_blocks(&mut state);
        state.threads.clear();
        drop(state);

        self.wake_pause_gate();
        self.logger.log(|| Event::Flush);
    }
}

/// ////////////////////////////////////////////////////////////////////////
/// Block hooks

/// Record the calling thread as sleeping on `block`.
///
/// Called by a block right before it starts its registered wait loop. Fails
/// with [`Interrupted`], leaving no record behind, if the thread or the
/// program was already asked to end, so an interrupted thread never starts
/// sleeping. Unregistered threads are not recorded; their waits simply
/// cannot be broken from outside.
///
/// # Panics
///
/// If the thread is already recorded as sleeping on a block: a single thread
/// cannot wait in two places at once.
pub(crate) fn about_to_sleep(block: &Block) -> Result<(), Interrupted> {
    let registry = match program() {
        Some(registry) => registry,
        None => return Err(Interrupted),
    };
    match current() {
        Some(thread) => registry.record_waiter(&thread, block),
        None => Ok(()),
    }
}

/// Ask whether a native wake was a logical one. `Ok(true)` also clears the
/// waiter record; `Ok(false)` sends the caller back to sleep.
pub(crate) fn should_wake(block: &Block) -> Result<bool, Interrupted> {
    let registry = match program() {
        Some(registry) => registry,
        None => return Err(Interrupted),
    };
    match current() {
        Some(thread) => registry.consult_wake(&thread, block),
        None => Ok(true),
    }
}

/// Unconditional cleanup on every exit from a wait (success, timeout or
/// failure); re-checks interruption so a cancellation that arrived during
/// the wait is not lost.
pub(crate) fn has_woken(block: &Block) -> Result<(), Interrupted> {
    let registry = match program() {
        Some(registry) => registry,
        None => return Err(Interrupted),
    };
    match current() {
        Some(thread) => registry.waiter_woke(&thread, block),
        None => Ok(()),
    }
}

/// Let a single waiter of `block` through its next `should_wake`.
pub(crate) fn set_should_wake_one(block: &Block) {
    if let Some(registry) = program() {
        registry.mark_waiters(block, false);
    }
}

/// Let every waiter of `block` through its next `should_wake`.
pub(crate) fn set_should_wake_all(block: &Block) {
    if let Some(registry) = program() {
        registry.mark_waiters(block, true);
    }
}

/// ////////////////////////////////////////////////////////////////////////
/// Registration

/// Register the calling thread with for-ages and return its id.
///
/// Registration is what lets the control plane pause or end this thread.
/// Unregistered threads may still use every primitive; they just cannot be
/// reached by `pause`/`end`, and their checkpoints are free passes.
///
/// Returns `None` once [`fini`] has shut the subsystem down.
///
/// # Panics
///
/// If this thread already holds a registration slot. The slot lives until
/// the thread exits, so a thread cannot re-register after unregistering.
pub fn register_this_thread() -> Option<ThreadId> {
    let registry = program()?;
    let mut state = registry.state.write().unwrap();
    THREAD_STATE.with(|slot| {
        let mut slot = slot.0.borrow_mut();
        if slot.is_some() {
            panic!("this thread is already registered with for-ages");
        }
        state.last_id += 1;
        let id = ThreadId(state.last_id);
        let thread = Arc::new(ThreadState::new(id));
        state.threads.insert(id, Arc::clone(&thread));
        *slot = Some(thread);
        registry.logger.log(|| Event::ThreadRegistered { id });
        Some(id)
    })
}

/// Detach the calling thread from the registry.
///
/// The thread's slot (and with it the per-thread flags) lives on until the
/// thread exits; only the control plane's reach ends here. Unregistering a
/// thread that was never registered is a no-op.
pub fn unregister_this_thread() {
    if let Some(registry) = existing_program() {
        if let Some(thread) = current() {
            registry.detach(&thread);
        }
    }
}

/// The calling thread's registry id, if it is registered.
pub fn this_thread_id() -> Option<ThreadId> {
    current().map(|thread| thread.id)
}

/// Set the display name used for the calling thread in diagnostics.
/// Ignored on unregistered threads.
pub fn set_this_thread_name(name: &str) {
    if let Some(thread) = current() {
        *thread.name.lock().unwrap() = name.to_owned();
    }
}

/// The calling thread's display name; `None` if the thread is unregistered,
/// the empty string if it never set one.
pub fn get_this_thread_name() -> Option<String> {
    current().map(|thread| thread.name.lock().unwrap().clone())
}

/// ////////////////////////////////////////////////////////////////////////
/// Pause / play / end

/// Pause every thread at its next checkpoint by raising the global pause
/// flag. Returns whether the flag changed.
pub fn pause() -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let changed = registry.set_global_pause(true);
    registry.logger.log(|| Event::PauseRequested {
        thread: None,
        changed,
    });
    changed
}

/// Clear the global pause flag and wake the pause gate. Returns whether the
/// flag changed.
pub fn play() -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let changed = registry.set_global_pause(false);
    registry.logger.log(|| Event::PlayRequested {
        thread: None,
        changed,
    });
    changed
}

/// Pause one thread at its next checkpoint. Returns false if the thread is
/// unknown or already paused.
pub fn pause_thread(id: ThreadId) -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let thread = {
        let state = registry.state.read().unwrap();
        match state.threads.get(&id) {
            Some(thread) => Arc::clone(thread),
            None => return false,
        }
    };
    let changed = {
        let _guard = registry.pause.lock().unwrap();
        !thread.flags.paused.swap(true, Ordering::SeqCst)
    };
    registry.logger.log(|| Event::PauseRequested {
        thread: Some(id),
        changed,
    });
    changed
}

/// Resume one paused thread. Returns whether the call actually woke it: a
/// thread whose per-thread flag is cleared while the global pause is still
/// up stays at the gate, and the call reports false.
pub fn play_thread(id: ThreadId) -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let thread = {
        let state = registry.state.read().unwrap();
        match state.threads.get(&id) {
            Some(thread) => Arc::clone(thread),
            None => return false,
        }
    };
    let woke = {
        let _guard = registry.pause.lock().unwrap();
        if thread.flags.paused.swap(false, Ordering::SeqCst)
            && !registry.is_paused.load(Ordering::SeqCst)
        {
            registry.pause_gate.notify_all();
            true
        } else {
            false
        }
    };
    registry.logger.log(|| Event::PlayRequested {
        thread: Some(id),
        changed: woke,
    });
    woke
}

/// Raise the pause flag of every registered thread *and* the global one.
/// Returns whether anything changed.
pub fn pause_all() -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let mut state = registry.state.write().unwrap();
    state.blocks.retain(|(weak, _)| !weak.is_expired());

    let some_changed = {
        let _guard = registry.pause.lock().unwrap();
        let mut some_changed = false;
        for thread in state.threads.values() {
            if !thread.flags.paused.swap(true, Ordering::SeqCst) {
                some_changed = true;
            }
        }
        if !registry.is_paused.swap(true, Ordering::SeqCst) {
            some_changed = true;
        }
        some_changed
    };
    drop(state);

    registry.logger.log(|| Event::PauseRequested {
        thread: None,
        changed: some_changed,
    });
    some_changed
}

/// Clear the pause flag of every registered thread and the global one, then
/// wake the gate. The broadcast is skipped when nothing actually changed,
/// so an immediate `pause_all`/`play_all` pair stays cheap.
pub fn play_all() -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let mut state = registry.state.write().unwrap();
    state.blocks.retain(|(weak, _)| !weak.is_expired());

    let some_changed = {
        let _guard = registry.pause.lock().unwrap();
        let mut some_changed = false;
        for thread in state.threads.values() {
            if thread.flags.paused.swap(false, Ordering::SeqCst) {
                some_changed = true;
            }
        }
        if registry.is_paused.swap(false, Ordering::SeqCst) {
            some_changed = true;
        }
        if some_changed {
            registry.pause_gate.notify_all();
        }
        some_changed
    };
    drop(state);

    registry.logger.log(|| Event::PlayRequested {
        thread: None,
        changed: some_changed,
    });
    some_changed
}

/// End for-ages for the whole program: every registered thread fails with
/// [`Interrupted`] at its next blocking call or checkpoint. Returns false if
/// the end had already been signalled.
pub fn end() -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let mut state = registry.state.write().unwrap();
    let changed = !registry.is_interrupted.swap(true, Ordering::SeqCst);
    if changed {
        Registry::sweep_blocks(&mut state);
    }
    drop(state);
    if changed {
        registry.wake_pause_gate();
    }
    registry.logger.log(|| Event::EndRequested {
        thread: None,
        changed,
    });
    changed
}

/// End for-ages for one thread. Returns false if the thread is unknown or
/// was already interrupted.
///
/// The thread's current block is poked even when the flag was already set:
/// the thread may have re-entered a wait since the previous end call, and
/// the extra wake costs nothing.
pub fn end_thread(id: ThreadId) -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let state = registry.state.write().unwrap();
    let thread = match state.threads.get(&id) {
        Some(thread) => Arc::clone(thread),
        None => {
            drop(state);
            registry.logger.log(|| Event::EndRequested {
                thread: Some(id),
                changed: false,
            });
            return false;
        }
    };
    let changed = !thread.flags.interrupted.swap(true, Ordering::SeqCst);
    let current_block = thread.current.lock().unwrap().clone();
    drop(state);

    if let Some(weak) = current_block {
        weak.check_end_for_ages();
    }
    if changed {
        registry.wake_pause_gate();
    }
    registry.logger.log(|| Event::EndRequested {
        thread: Some(id),
        changed,
    });
    changed
}

/// End for-ages for every registered thread individually *and* globally.
/// Returns whether anything changed.
pub fn end_all() -> bool {
    let registry = match program() {
        Some(registry) => registry,
        None => return false,
    };
    let mut state = registry.state.write().unwrap();
    let mut some_changed = false;
    for thread in state.threads.values() {
        if !thread.flags.interrupted.swap(true, Ordering::SeqCst) {
            some_changed = true;
        }
    }
    if !registry.is_interrupted.swap(true, Ordering::SeqCst) {
        some_changed = true;
    }
    if some_changed {
        Registry::sweep_blocks(&mut state);
    }
    drop(state);

    if some_changed {
        registry.wake_pause_gate();
    }
    registry.logger.log(|| Event::EndRequested {
        thread: None,
        changed: some_changed,
    });
    some_changed
}

/// ////////////////////////////////////////////////////////////////////////
/// Checkpoints and sleeping

/// Cooperative checkpoint.
///
/// Returns immediately unless the calling thread is paused, in which case
/// it blocks on the pause gate until played, or has been ended, in which
/// case it fails with [`Interrupted`]. Sprinkle these through long
/// computations so the controller can always reach the thread.
///
/// On an unregistered thread this is a free pass (a diagnostic event is
/// logged): such a thread cannot be paused or ended.
pub fn checkpoint() -> Result<(), Interrupted> {
    let registry = match program() {
        Some(registry) => registry,
        None => return checkpoint_after_fini(),
    };
    match current() {
        Some(thread) => registry.test_thread(&thread),
        None => {
            registry.logger.log(|| Event::UnregisteredCheckpoint);
            Ok(())
        }
    }
}

/// After `fini` the registry is gone, but the interrupt flag it raised
/// lives on in each thread's slot; honour it so a thread still stuck
/// behind a never-released lock keeps failing instead of spinning.
fn checkpoint_after_fini() -> Result<(), Interrupted> {
    match current() {
        Some(thread) if thread.flags.interrupted.load(Ordering::SeqCst) => Err(Interrupted),
        _ => Ok(()),
    }
}

/// Like [`checkpoint`], but only performs the full test every `n` calls,
/// for checkpointing tight loops cheaply.
///
/// # Panics
///
/// If `n` is zero.
pub fn checkpoint_every(n: u32) -> Result<(), Interrupted> {
    assert!(n > 0, "checkpoint_every needs a positive interval");
    let registry = match program() {
        Some(registry) => registry,
        None => return checkpoint_after_fini(),
    };
    let thread = match current() {
        Some(thread) => thread,
        None => {
            registry.logger.log(|| Event::UnregisteredCheckpoint);
            return Ok(());
        }
    };
    let count = thread.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    if count % n == 0 {
        registry.test_thread(&thread)
    } else {
        Ok(())
    }
}

/// Checkpoint and report `true`, for driving loops that run until the
/// controller ends them:
///
/// ```no_run
/// # fn work() {}
/// # fn run() -> Result<(), for_ages::Interrupted> {
/// while for_ages::proceed()? {
///     work();
/// }
/// # Ok(())
/// # }
/// ```
pub fn proceed() -> Result<bool, Interrupted> {
    checkpoint().map(|()| true)
}

/// [`proceed`] with the cost profile of [`checkpoint_every`].
pub fn proceed_every(n: u32) -> Result<bool, Interrupted> {
    checkpoint_every(n).map(|()| true)
}

/// Interruptible sleep: blocks for `duration` unless the thread is ended
/// first, in which case it fails at the moment of interruption rather than
/// sleeping the budget out. A zero duration returns immediately.
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    if duration.is_zero() {
        return Ok(());
    }
    WaitCondition::new().wait_for(duration).map(|_| ())
}

/// [`sleep`] in milliseconds.
pub fn msleep(ms: u64) -> Result<(), Interrupted> {
    sleep(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    // Tests here stick to per-thread state; everything touching the global
    // pause or interrupt flags lives in its own integration-test binary.

    #[test]
    fn ids_are_monotonic_across_threads() {
        let first = thread::spawn(|| {
            let id = register_this_thread().unwrap();
            unregister_this_thread();
            id
        })
        .join()
        .unwrap();
        let second = thread::spawn(|| {
            let id = register_this_thread().unwrap();
            unregister_this_thread();
            id
        })
        .join()
        .unwrap();
        assert!(second.as_u64() > first.as_u64());
    }

    #[test]
    fn names_round_trip() {
        thread::spawn(|| {
            assert_eq!(get_this_thread_name(), None);
            register_this_thread().unwrap();
            assert_eq!(get_this_thread_name().as_deref(), Some(""));
            set_this_thread_name("miller");
            assert_eq!(get_this_thread_name().as_deref(), Some("miller"));
            unregister_this_thread();
            // The slot outlives unregistration.
            assert_eq!(get_this_thread_name().as_deref(), Some("miller"));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn unregistered_checkpoints_pass() {
        thread::spawn(|| {
            assert_eq!(this_thread_id(), None);
            checkpoint().unwrap();
            assert!(proceed().unwrap());
            assert!(proceed_every(8).unwrap());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn unknown_thread_ids_are_rejected() {
        assert!(!pause_thread(ThreadId(u64::MAX)));
        assert!(!play_thread(ThreadId(u64::MAX)));
        assert!(!end_thread(ThreadId(u64::MAX)));
    }

    #[test]
    fn hooks_are_free_passes_for_unregistered_threads() {
        thread::spawn(|| {
            let block = Block::new_mutex();
            about_to_sleep(&block).unwrap();
            assert!(should_wake(&block).unwrap());
            has_woken(&block).unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn sleep_zero_returns_immediately() {
        let timer = crate::Timer::start();
        sleep(Duration::ZERO).unwrap();
        msleep(0).unwrap();
        assert!(timer.elapsed() < Duration::from_millis(100));
    }
}
