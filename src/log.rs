//! Debug logging for registry and block activity.
//!
//! When logs are disabled (the default), recording an event costs one branch.
//! When enabled, events are shipped over a channel to a dedicated writer
//! thread so the hot paths never block on I/O.
//!
//! Set the `FOR_AGES_LOG` environment variable to enable:
//!
//! * `FOR_AGES_LOG=all` writes every event to stderr as it happens;
//!   `all:<path>` writes to a file instead.
//! * `FOR_AGES_LOG=tail:<n>` retains the last `n` events in memory and dumps
//!   them when the logger is flushed (at `fini`); `tail:<n>:<path>` likewise
//!   writes to a file.

use std::collections::VecDeque;
use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::block::BlockKind;
use crate::registry::ThreadId;

/// Timeline of interesting things happening inside the subsystem.
#[derive(Debug)]
pub(crate) enum Event {
    /// A thread joined the registry.
    ThreadRegistered { id: ThreadId },
    /// A thread was detached from the registry, by itself or by its exit guard.
    ThreadUnregistered { id: ThreadId },
    /// A checkpoint ran on a thread that never registered; pause and end
    /// cannot reach such a thread.
    UnregisteredCheckpoint,
    /// A thread parked itself on the pause gate.
    PausedAtGate { id: ThreadId },
    /// A thread came back from the pause gate and is re-testing its flags.
    WokeFromGate { id: ThreadId },
    /// A checkpoint or block hook turned the interrupt flag into an error.
    Interrupted { id: ThreadId },
    /// A thread was recorded as sleeping on a block.
    WaiterRecorded { id: ThreadId, kind: BlockKind },
    /// A thread's waiter record was cleared.
    WaiterCleared { id: ThreadId, kind: BlockKind },
    /// `wake_one` selected a single waiter (if any) to let through.
    WakeOne {
        kind: BlockKind,
        target: Option<ThreadId>,
    },
    /// `wake_all` let every current waiter of a block through.
    WakeAll { kind: BlockKind, woken: usize },
    /// A pause was requested, globally (`thread: None`) or for one thread.
    PauseRequested {
        thread: Option<ThreadId>,
        changed: bool,
    },
    /// A resume was requested.
    PlayRequested {
        thread: Option<ThreadId>,
        changed: bool,
    },
    /// An end was requested.
    EndRequested {
        thread: Option<ThreadId>,
        changed: bool,
    },
    /// Write out anything buffered; sent during teardown.
    Flush,
}

/// Handle for recording events. Cheap to clone; all clones feed the same
/// writer.
#[derive(Clone, Debug)]
pub(crate) struct Logger {
    sender: Option<Sender<Event>>,
}

impl Logger {
    pub(crate) fn new() -> Logger {
        let spec = match env::var("FOR_AGES_LOG") {
            Ok(spec) => spec,
            Err(_) => return Logger::disabled(),
        };

        let (sender, receiver) = crossbeam_channel::unbounded();

        let mut parts = spec.splitn(2, ':');
        let mode = parts.next().unwrap_or("");
        let rest = parts.next();
        match mode {
            "all" => {
                let sink = sink_from(rest);
                spawn_writer(move || all_writer(receiver, sink));
            }
            "tail" => {
                let mut rest = rest.unwrap_or("").splitn(2, ':');
                let capacity = rest
                    .next()
                    .and_then(|n| n.parse::<usize>().ok())
                    .unwrap_or_else(|| bad_spec(&spec));
                let sink = sink_from(rest.next());
                spawn_writer(move || tail_writer(receiver, capacity, sink));
            }
            _ => bad_spec(&spec),
        }

        Logger {
            sender: Some(sender),
        }
    }

    /// A logger that drops everything.
    pub(crate) fn disabled() -> Logger {
        Logger { sender: None }
    }

    /// Record an event. The closure only runs when logging is enabled.
    #[inline]
    pub(crate) fn log(&self, event: impl FnOnce() -> Event) {
        if let Some(sender) = &self.sender {
            // Best effort: a dead writer must never take the program down.
            let _ = sender.send(event());
        }
    }
}

fn bad_spec(spec: &str) -> ! {
    panic!(
        "FOR_AGES_LOG should be 'all', 'all:<path>', 'tail:<n>' or 'tail:<n>:<path>', not {:?}",
        spec
    )
}

fn sink_from(path: Option<&str>) -> Box<dyn Write + Send> {
    match path {
        Some(path) if !path.is_empty() => Box::new(
            File::create(path).expect("failed to create FOR_AGES_LOG output file"),
        ),
        _ => Box::new(io::stderr()),
    }
}

fn spawn_writer(writer: impl FnOnce() + Send + 'static) {
    thread::Builder::new()
        .name("for-ages-log".to_owned())
        .spawn(writer)
        .expect("failed to spawn the for-ages log writer");
}

fn all_writer(receiver: Receiver<Event>, mut sink: Box<dyn Write + Send>) {
    for event in receiver {
        if let Event::Flush = event {
            let _ = sink.flush();
        } else {
            let _ = writeln!(sink, "{:?}", event);
        }
    }
    let _ = sink.flush();
}

fn tail_writer(receiver: Receiver<Event>, capacity: usize, mut sink: Box<dyn Write + Send>) {
    let mut tail = VecDeque::with_capacity(capacity);
    for event in receiver {
        if let Event::Flush = event {
            for event in tail.drain(..) {
                let _ = writeln!(sink, "{:?}", event);
            }
            let _ = sink.flush();
        } else {
            if tail.len() == capacity {
                tail.pop_front();
            }
            tail.push_back(event);
        }
    }
}
