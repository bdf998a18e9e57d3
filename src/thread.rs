//! Registered worker threads.
//!
//! A worker spawned here registers itself with the registry before running
//! the caller's closure and detaches on the way out, so the controller can
//! pause or end it from the moment the closure starts. The spawning thread
//! learns the worker's [`ThreadId`] before `spawn` returns.

use std::fmt;
use std::io;
use std::sync::mpsc;
use std::thread;

use crate::registry::{self, ThreadId};
use crate::Interrupted;

/// Builder for a registered worker thread, mirroring `std::thread::Builder`.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    /// A builder with default settings.
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Name the worker. The name is applied to the OS thread and to the
    /// registry entry.
    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.name = Some(name.into());
        self
    }

    /// Stack size for the worker, in bytes.
    pub fn stack_size(mut self, stack_size: usize) -> Builder {
        self.stack_size = Some(stack_size);
        self
    }

    /// Spawn the worker. Blocks until the child has registered, so the
    /// returned handle always carries a usable id.
    ///
    /// The closure runs registered: an uncaught [`Interrupted`] bubbles out
    /// as the worker's result and the thread exits cleanly. The worker
    /// unregisters on the way out, including on panic (the thread-local
    /// registration guard detaches it while unwinding).
    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> Result<T, Interrupted> + Send + 'static,
        T: Send + 'static,
    {
        let Builder { name, stack_size } = self;
        let mut builder = thread::Builder::new();
        if let Some(name) = &name {
            builder = builder.name(name.clone());
        }
        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }

        let (id_sender, id_receiver) = mpsc::channel();
        let inner = builder.spawn(move || {
            let id = registry::register_this_thread();
            if let Some(name) = &name {
                registry::set_this_thread_name(name);
            }
            let _ = id_sender.send(id);
            if id.is_none() {
                // The subsystem was already shut down; there is nothing to run.
                return Err(Interrupted);
            }
            let result = f();
            registry::unregister_this_thread();
            result
        })?;

        let id = id_receiver.recv().unwrap_or(None);
        Ok(JoinHandle { id, inner })
    }
}

/// Handle to a registered worker, joining to the closure's result.
pub struct JoinHandle<T> {
    id: Option<ThreadId>,
    inner: thread::JoinHandle<Result<T, Interrupted>>,
}

impl<T> JoinHandle<T> {
    /// The worker's registry id. `None` only when the subsystem had already
    /// been shut down when the worker started.
    pub fn id(&self) -> Option<ThreadId> {
        self.id
    }

    /// Wait for the worker to finish. Panics in the worker propagate as
    /// with `std::thread::JoinHandle::join`.
    pub fn join(self) -> thread::Result<Result<T, Interrupted>> {
        self.inner.join()
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("id", &self.id).finish()
    }
}

/// Spawn a registered worker with default settings.
///
/// # Panics
///
/// If the OS refuses to spawn a thread; use [`Builder::spawn`] to handle
/// that case.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> Result<T, Interrupted> + Send + 'static,
    T: Send + 'static,
{
    Builder::new()
        .spawn(f)
        .expect("failed to spawn for-ages worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_run_registered() {
        let worker = Builder::new()
            .name("carter")
            .spawn(|| {
                assert!(registry::this_thread_id().is_some());
                assert_eq!(registry::get_this_thread_name().as_deref(), Some("carter"));
                Ok(7)
            })
            .unwrap();
        assert!(worker.id().is_some());
        assert_eq!(worker.join().unwrap().unwrap(), 7);
    }

    #[test]
    fn handle_id_matches_the_worker() {
        let (sender, receiver) = mpsc::channel();
        let worker = spawn(move || {
            let _ = sender.send(registry::this_thread_id());
            Ok(())
        });
        let seen = receiver.recv().unwrap();
        assert_eq!(worker.id(), seen);
        worker.join().unwrap().unwrap();
    }
}
