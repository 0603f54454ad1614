//! Async offload queues
//!
//! A processor hands expensive work to an [`AsyncQueue`] so the dispatcher's
//! slot frees up as soon as the processor returns. Each queue owns one
//! in-flight slot of its own; a submission made while that slot is taken is
//! dropped, never queued.

use std::fmt;
use std::sync::Arc;

use color_eyre::eyre;
use tracing::{instrument, trace, warn};

use super::bridge::{guarded, ErrorBridge, ErrorKind};
use super::context::{Job, ProcessingContext, WorkerThread};
use super::slot::{Counters, InFlightSlot, PipelineStats};
use crate::capture::Frame;
use crate::error::{PipelineError, Result};

/// Outcome of [`AsyncQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Scheduled,
    /// The queue was busy; the task was discarded without running
    Dropped,
}

pub struct AsyncQueue {
    name: String,
    slot: Arc<InFlightSlot>,
    context: Arc<dyn ProcessingContext>,
    bridge: ErrorBridge,
    counters: Arc<Counters>,
}

impl AsyncQueue {
    pub fn new(
        name: impl Into<String>,
        context: Arc<dyn ProcessingContext>,
        bridge: ErrorBridge,
    ) -> Self {
        Self {
            name: name.into(),
            slot: InFlightSlot::new(),
            context,
            bridge,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Queue backed by a dedicated thread named after the queue.
    #[instrument(skip(bridge))]
    pub fn with_worker(name: &str, bridge: ErrorBridge) -> Result<Self> {
        let worker = WorkerThread::spawn(name)?;
        Ok(Self::new(name, Arc::new(worker), bridge))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Run `task` on this queue's context with its own reference to `frame`,
    /// so the buffer outlives the processor invocation that submitted it.
    ///
    /// Fails with `UseAfterRelease` if `frame` is no longer alive.
    pub fn enqueue<F>(&self, frame: &Frame, task: F) -> Result<Enqueued>
    where
        F: FnOnce(&Frame) -> eyre::Result<()> + Send + 'static,
    {
        if !frame.is_valid() {
            return Err(PipelineError::UseAfterRelease {
                sequence: frame.sequence(),
            });
        }
        Counters::bump(&self.counters.submitted);

        let Some(permit) = self.slot.try_acquire() else {
            trace!(queue = %self.name, sequence = frame.sequence(), "queue busy, dropping task");
            Counters::bump(&self.counters.dropped_busy);
            metrics::counter!("framepipe_offload_dropped", "queue" => self.name.clone())
                .increment(1);
            return Ok(Enqueued::Dropped);
        };

        let lease = frame.lease()?;
        let name = self.name.clone();
        let bridge = self.bridge.clone();
        let counters = Arc::clone(&self.counters);
        let job: Job = Box::new(move || {
            Counters::bump(&counters.delivered);
            metrics::counter!("framepipe_offload_started", "queue" => name.clone()).increment(1);
            let failure = guarded(ErrorKind::AsyncTaskThrow, &name, lease.sequence(), || {
                task(&lease)
            });
            Counters::bump(&counters.completed);
            if let Some(error) = failure {
                Counters::bump(&counters.failed);
                metrics::counter!("framepipe_offload_failures", "queue" => name).increment(1);
                bridge.report(error);
            }
            drop(lease);
            drop(permit);
        });

        if let Err(e) = self.context.execute(job) {
            warn!(queue = %self.name, "offload context rejected task: {}", e);
            return Err(e);
        }
        metrics::counter!("framepipe_offload_scheduled", "queue" => self.name.clone()).increment(1);
        Ok(Enqueued::Scheduled)
    }
}

impl fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("name", &self.name)
            .field("context", &self.context.name())
            .field("busy", &self.slot.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::error::PipelineError;
    use crate::pipeline::context::InlineContext;
    use bytes::Bytes;
    use color_eyre::eyre::eyre;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn frame(recycled: &Arc<AtomicUsize>) -> Frame {
        let recycled = Arc::clone(recycled);
        Frame::new(
            Bytes::from_static(b"abcd"),
            FrameMetadata::new(5, 2, 2, PixelFormat::Gray8),
            Arc::new(move |_: Bytes, _: &FrameMetadata| {
                recycled.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_second_enqueue_on_busy_queue_is_dropped() {
        let (bridge, errors) = ErrorBridge::channel();
        let queue = AsyncQueue::with_worker("test-offload", bridge).unwrap();
        let recycled = Arc::new(AtomicUsize::new(0));
        let f = frame(&recycled);

        let (started_tx, started_rx) = flume::bounded(1);
        let (resume_tx, resume_rx) = flume::bounded::<()>(1);
        let (done_tx, done_rx) = flume::bounded(1);
        let first = queue
            .enqueue(&f, move |frame| {
                started_tx.send(()).ok();
                resume_rx.recv().ok();
                done_tx.send(frame.ref_count()).ok();
                Ok(())
            })
            .unwrap();
        assert_eq!(first, Enqueued::Scheduled);
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_task = Arc::clone(&ran);
        let second = queue
            .enqueue(&f, move |_| {
                ran_in_task.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(second, Enqueued::Dropped);
        assert_eq!(f.ref_count(), 2);

        resume_tx.send(()).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
        drop(queue);

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(f.ref_count(), 1);
        assert!(errors.try_recv().is_none());
    }

    #[test]
    fn test_task_failure_is_reported() {
        let (bridge, errors) = ErrorBridge::channel();
        let queue = AsyncQueue::with_worker("test-offload-fail", bridge).unwrap();
        let recycled = Arc::new(AtomicUsize::new(0));
        let f = frame(&recycled);

        queue.enqueue(&f, |_| Err(eyre!("upload failed"))).unwrap();
        f.release().unwrap();

        let report = errors
            .recv_timeout(Duration::from_secs(1))
            .expect("task failure should be reported");
        assert_eq!(report.kind, ErrorKind::AsyncTaskThrow);
        assert_eq!(report.source, "test-offload-fail");
        assert!(report.message.contains("upload failed"));

        drop(queue);
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
        assert_eq!(errors.pending(), 0);
    }

    #[test]
    fn test_enqueue_released_frame_fails() {
        let (bridge, _errors) = ErrorBridge::channel();
        let queue = AsyncQueue::new("inline", Arc::new(InlineContext), bridge);
        let recycled = Arc::new(AtomicUsize::new(0));
        let f = frame(&recycled);
        f.release().unwrap();

        let result = queue.enqueue(&f, |_| Ok(()));
        assert!(matches!(result, Err(PipelineError::UseAfterRelease { .. })));
        assert!(!queue.is_busy());

        // Refused even when the queue would have dropped it as busy
        let (bridge, _errors) = ErrorBridge::channel();
        let busy = AsyncQueue::with_worker("test-offload-refuse", bridge).unwrap();
        let live = frame(&recycled);
        let (resume_tx, resume_rx) = flume::bounded::<()>(1);
        busy.enqueue(&live, move |_| {
            resume_rx.recv().ok();
            Ok(())
        })
        .unwrap();
        assert!(busy.is_busy());
        assert!(matches!(
            busy.enqueue(&f, |_| Ok(())),
            Err(PipelineError::UseAfterRelease { sequence: 5 })
        ));
        assert_eq!(busy.stats().dropped_busy, 0);
        resume_tx.send(()).unwrap();
    }

    #[test]
    fn test_independent_queues_do_not_share_busy_state() {
        let (bridge, _errors) = ErrorBridge::channel();
        let a = AsyncQueue::with_worker("test-queue-a", bridge.clone()).unwrap();
        let b = AsyncQueue::new("test-queue-b", Arc::new(InlineContext), bridge);
        let recycled = Arc::new(AtomicUsize::new(0));
        let f = frame(&recycled);

        let (resume_tx, resume_rx) = flume::bounded::<()>(1);
        assert_eq!(
            a.enqueue(&f, move |_| {
                resume_rx.recv().ok();
                Ok(())
            })
            .unwrap(),
            Enqueued::Scheduled
        );
        assert_eq!(b.enqueue(&f, |_| Ok(())).unwrap(), Enqueued::Scheduled);
        assert_eq!(b.stats().completed, 1);

        resume_tx.send(()).unwrap();
        drop(a);
        assert_eq!(f.ref_count(), 1);
    }
}
