//! # Asynchronous Writer
//!
//! A single background thread consumes a FIFO queue of write commands and
//! sync barriers against a [`WriteTarget`]. Commit enqueues many page writes
//! cheaply and blocks exactly once, on the closing barrier, instead of
//! performing synchronous I/O per page.
//!
//! ## Guarantees
//!
//! - Writes are issued to the target in submission order.
//! - A barrier is acknowledged only after every write submitted before it has
//!   completed; writes submitted after a barrier never reorder ahead of it.
//! - On the first write or sync error the worker latches the failure: no
//!   later command is executed, and the error is surfaced to the barrier that
//!   is (or will be) waiting, and through it to the committing caller.
//!
//! There is no cancellation of enqueued writes. That is safe because nothing
//! references freshly written pages until the commit's meta page, which is
//! only written after all prior writes and their barrier succeeded.
//!
//! The queue is a `Mutex<VecDeque>` with a condvar, the barrier a completion
//! flag plus latched error with its own condvar.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{eyre, Result, WrapErr};
use parking_lot::{Condvar, Mutex};

use crate::vfs::WriteTarget;

enum Command {
    Write {
        offset: u64,
        buf: Vec<u8>,
    },
    Sync {
        barrier: Arc<WriteBarrier>,
    },
    Stop,
}

#[derive(Debug, Default)]
struct BarrierState {
    done: bool,
    error: Option<String>,
}

/// Completion point for a batch of scheduled writes.
#[derive(Debug, Default)]
pub struct WriteBarrier {
    state: Mutex<BarrierState>,
    completed: Condvar,
}

impl WriteBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks until the barrier is acknowledged; returns the writer error if
    /// the batch failed.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while !state.done {
            self.completed.wait(&mut state);
        }
        match &state.error {
            None => Ok(()),
            Some(msg) => Err(eyre!("async writer failed: {msg}")),
        }
    }

    fn complete(&self, error: Option<String>) {
        let mut state = self.state.lock();
        state.done = true;
        state.error = error;
        self.completed.notify_all();
    }
}

struct WriterShared {
    queue: Mutex<VecDeque<Command>>,
    available: Condvar,
}

/// Handle to the background writer thread.
pub struct Writer {
    shared: Arc<WriterShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    /// Spawns the worker thread against the given target.
    pub fn spawn(target: Arc<dyn WriteTarget>) -> Result<Writer> {
        let shared = Arc::new(WriterShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("pagestore-writer".into())
            .spawn(move || run_worker(worker_shared, target))
            .wrap_err("failed to spawn the writer thread")?;

        Ok(Writer {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueues one positional write.
    pub fn schedule(&self, offset: u64, buf: Vec<u8>) {
        self.push(Command::Write { offset, buf });
    }

    /// Enqueues a sync barrier; `barrier.wait()` blocks until every command
    /// enqueued before it has completed.
    pub fn sync(&self, barrier: Arc<WriteBarrier>) {
        self.push(Command::Sync { barrier });
    }

    fn push(&self, cmd: Command) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(cmd);
        self.shared.available.notify_one();
    }

    /// Stops the worker after the commands already enqueued. Idempotent.
    pub fn stop(&self) {
        let taken = self.handle.lock().take();
        if let Some(handle) = taken {
            self.push(Command::Stop);
            let _ = handle.join();
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: Arc<WriterShared>, target: Arc<dyn WriteTarget>) {
    // first error latched for the rest of the session
    let mut failure: Option<String> = None;

    loop {
        let cmd = {
            let mut queue = shared.queue.lock();
            loop {
                match queue.pop_front() {
                    Some(cmd) => break cmd,
                    None => shared.available.wait(&mut queue),
                }
            }
        };

        match cmd {
            Command::Write { offset, buf } => {
                if failure.is_some() {
                    continue;
                }
                if let Err(err) = target.write_at(&buf, offset) {
                    failure = Some(format!("{err:#}"));
                }
            }
            Command::Sync { barrier } => {
                if failure.is_none() {
                    if let Err(err) = target.sync() {
                        failure = Some(format!("{err:#}"));
                    }
                }
                barrier.complete(failure.clone());
            }
            Command::Stop => break,
        }
    }
}
