//! Execution contexts that run processor invocations and offloaded tasks.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use flume::Sender;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};

/// Unit of work submitted to a context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere a job can run. Implementations must not block the submitter.
pub trait ProcessingContext: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, job: Job) -> Result<()>;
}

/// Dedicated named thread fed through a channel.
pub struct WorkerThread {
    name: String,
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        Self::spawn_pinned(name, None)
    }

    /// Spawn the worker, optionally pinned to a CPU core.
    pub fn spawn_pinned(name: impl Into<String>, core: Option<usize>) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = flume::unbounded::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Some(core) = core {
                    if !crate::utils::pin_current_thread(core) {
                        warn!(worker = %thread_name, core, "failed to pin worker");
                    }
                }
                debug!(worker = %thread_name, "worker started");
                for job in rx.iter() {
                    // Jobs catch their own panics; this keeps the thread alive regardless
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(worker = %thread_name, "job panicked");
                    }
                }
                debug!(worker = %thread_name, "worker stopped");
            })?;

        info!("Spawned worker thread {}", name);
        Ok(Self {
            name,
            tx: Some(tx),
            handle: Some(handle),
        })
    }
}

impl ProcessingContext for WorkerThread {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, job: Job) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PipelineError::ContextClosed(self.name.clone()))?;
        tx.send(job)
            .map_err(|_| PipelineError::ContextClosed(self.name.clone()))
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            // The last owner may be a job running on this very worker
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

/// Runs jobs on the submitting thread.
#[derive(Debug, Default)]
pub struct InlineContext;

impl ProcessingContext for InlineContext {
    fn name(&self) -> &str {
        "inline"
    }

    fn execute(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }
}

/// Runs jobs on a tokio runtime's blocking pool.
pub struct TokioContext {
    name: String,
    handle: tokio::runtime::Handle,
}

impl TokioContext {
    pub fn new(name: impl Into<String>, handle: tokio::runtime::Handle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// Bind to the runtime of the calling task.
    pub fn current(name: impl Into<String>) -> Self {
        Self::new(name, tokio::runtime::Handle::current())
    }
}

impl ProcessingContext for TokioContext {
    fn name(&self) -> &str {
        &self.name
    }

    /// A runtime that is shutting down drops the job unrun; its frame
    /// reference and slot are freed when the job is dropped.
    fn execute(&self, job: Job) -> Result<()> {
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}
