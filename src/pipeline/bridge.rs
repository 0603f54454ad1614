//! Relay of processing failures to the controlling context.
//!
//! Processors and offloaded tasks run on worker threads where an error has
//! nowhere useful to go. [`ErrorBridge::report`] pushes it onto an unbounded
//! channel and returns immediately; the controlling context picks reports up
//! whenever it next drains its [`ErrorReceiver`].

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use color_eyre::eyre;
use flume::{Receiver, Sender};
use serde::Serialize;
use tracing::{debug, warn};

/// Where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// The active frame processor returned an error or panicked
    ProcessorThrow,
    /// An offloaded task returned an error or panicked
    AsyncTaskThrow,
}

/// A failure raised by user or plugin code, detached from its thread.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingError {
    pub kind: ErrorKind,
    /// Processor or queue name
    pub source: String,
    /// Sequence number of the frame being processed
    pub sequence: u64,
    pub message: String,
}

impl ProcessingError {
    pub fn new(
        kind: ErrorKind,
        source: impl Into<String>,
        sequence: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
            sequence,
            message: message.into(),
        }
    }

    fn from_panic(
        kind: ErrorKind,
        source: &str,
        sequence: u64,
        payload: Box<dyn Any + Send>,
    ) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&str>() {
            format!("panicked: {}", msg)
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            format!("panicked: {}", msg)
        } else {
            "panicked".to_string()
        };
        Self::new(kind, source, sequence, message)
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} in {} (frame #{}): {}",
            self.kind, self.source, self.sequence, self.message
        )
    }
}

impl std::error::Error for ProcessingError {}

/// Run user code, turning an `Err` or a panic into a [`ProcessingError`].
pub(crate) fn guarded(
    kind: ErrorKind,
    source: &str,
    sequence: u64,
    f: impl FnOnce() -> eyre::Result<()>,
) -> Option<ProcessingError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => None,
        Ok(Err(report)) => Some(ProcessingError::new(
            kind,
            source,
            sequence,
            format!("{:#}", report),
        )),
        Err(payload) => Some(ProcessingError::from_panic(kind, source, sequence, payload)),
    }
}

/// Sending half; cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct ErrorBridge {
    tx: Sender<ProcessingError>,
}

/// Receiving half, owned by the controlling context.
pub struct ErrorReceiver {
    rx: Receiver<ProcessingError>,
}

impl ErrorBridge {
    pub fn channel() -> (ErrorBridge, ErrorReceiver) {
        let (tx, rx) = flume::unbounded();
        (ErrorBridge { tx }, ErrorReceiver { rx })
    }

    /// Fire-and-forget. Never blocks and never fails; a report nobody is
    /// listening for is logged and discarded.
    pub fn report(&self, error: ProcessingError) {
        warn!(
            kind = ?error.kind,
            source = %error.source,
            sequence = error.sequence,
            "{}",
            error.message
        );
        if let Err(flume::SendError(error)) = self.tx.send(error) {
            debug!("no error handler attached, dropping report: {}", error);
        }
    }
}

impl fmt::Debug for ErrorBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorBridge")
            .field("pending", &self.tx.len())
            .finish()
    }
}

impl ErrorReceiver {
    pub fn try_recv(&self) -> Option<ProcessingError> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProcessingError> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Hand every pending report to `handler` on the calling thread.
    pub fn drain(&self, mut handler: impl FnMut(ProcessingError)) -> usize {
        let mut delivered = 0;
        while let Ok(error) = self.rx.try_recv() {
            handler(error);
            delivered += 1;
        }
        delivered
    }

    /// Wait for the next report. `None` once every bridge is gone.
    pub async fn recv_async(&self) -> Option<ProcessingError> {
        self.rx.recv_async().await.ok()
    }

    /// Deliver reports until every bridge has been dropped.
    pub async fn run(self, mut handler: impl FnMut(ProcessingError)) {
        while let Some(error) = self.recv_async().await {
            handler(error);
        }
        debug!("error bridge closed");
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
