//! Dedicated execution thread for blocking engine work.
//!
//! Foreign callers arrive on arbitrary threads, some of which may belong to
//! the engine's own worker pool. Every engine call is therefore shipped to one
//! long-lived OS thread and the caller blocks until the result comes back.
//!
//! ```text
//! ┌──────────────┐   Command::Run(job)   ┌─────────────────────┐
//! │ caller thread │ ───────────────────> │ executor thread      │
//! │  (blocked)    │ <─── bounded(1) ──── │ runs jobs in order   │
//! └──────────────┘        result          └─────────────────────┘
//! ```
//!
//! A job submitted from the executor thread itself runs inline, so nested
//! calls cannot deadlock.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

/// Maximum queued jobs before submitters block.
const COMMAND_QUEUE_DEPTH: usize = 16;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn executor thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Executor is shut down")]
    ShutDown,
    #[error("Executor job panicked")]
    Aborted,
}

/// Handle to the executor thread.
pub struct Executor {
    cmd_tx: Sender<Command>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Spawn the executor on a new named OS thread.
    pub fn spawn(name: &str) -> Result<Self, ExecutorError> {
        let (cmd_tx, cmd_rx) = bounded::<Command>(COMMAND_QUEUE_DEPTH);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || executor_loop(cmd_rx))?;

        Ok(Self {
            cmd_tx,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `f` on the executor thread and block until it returns.
    pub fn run<T, F>(&self, f: F) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_executor_thread() {
            return Ok(f());
        }

        let (result_tx, result_rx) = bounded::<T>(1);
        let job: Job = Box::new(move || {
            let _ = result_tx.send(f());
        });
        self.cmd_tx
            .send(Command::Run(job))
            .map_err(|_| ExecutorError::ShutDown)?;

        // A dropped sender means the job panicked or was discarded at shutdown.
        result_rx.recv().map_err(|_| ExecutorError::Aborted)
    }

    /// Whether the current thread is the executor thread.
    pub fn is_executor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop the thread after the jobs already queued. Idempotent.
    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let _ = self.cmd_tx.send(Command::Shutdown);
        if thread.thread().id() != thread::current().id() {
            let _ = thread.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn executor_loop(cmd_rx: Receiver<Command>) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            Command::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("executor job panicked");
                }
            }
            Command::Shutdown => break,
        }
    }
    tracing::debug!("executor thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn runs_on_dedicated_thread() {
        let exec = Executor::spawn("test-executor").unwrap();
        let name = exec
            .run(|| thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-executor"));
        assert!(!exec.is_executor_thread());
    }

    #[test]
    fn nested_run_executes_inline() {
        let exec = Arc::new(Executor::spawn("nested").unwrap());
        let inner = exec.clone();
        let value = exec.run(move || inner.run(|| 7).unwrap() * 6).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn panicking_job_reports_aborted_and_thread_survives() {
        let exec = Executor::spawn("panics").unwrap();
        let err = exec.run(|| -> i32 { panic!("boom") }).unwrap_err();
        assert!(matches!(err, ExecutorError::Aborted));
        assert_eq!(exec.run(|| 1).unwrap(), 1);
    }

    #[test]
    fn run_after_shutdown_fails() {
        let exec = Executor::spawn("stopped").unwrap();
        exec.shutdown();
        exec.shutdown();
        assert!(matches!(exec.run(|| ()), Err(ExecutorError::ShutDown)));
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let exec = Executor::spawn("ordered").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = log.clone();
            exec.run(move || log.lock().push(i)).unwrap();
        }
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }
}
