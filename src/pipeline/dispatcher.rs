//! Frame processor dispatcher
//!
//! Delivers captured frames to the single active processor on a dedicated
//! processing context. The capture thread never waits: a frame arriving
//! while the previous one is still being processed, or while no processor is
//! set, is released straight back to the producer.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use color_eyre::eyre;
use tracing::{debug, instrument, trace, warn};

use super::bridge::{guarded, ErrorBridge, ErrorKind};
use super::context::{Job, ProcessingContext, WorkerThread};
use super::offload::AsyncQueue;
use super::slot::{Counters, InFlightSlot, PipelineStats};
use crate::capture::{Frame, FrameLease};
use crate::error::{PipelineError, Result};
use crate::PipelineConfig;

/// User code run for every delivered frame.
pub trait FrameProcessor: Send + Sync {
    fn process(&self, frame: &Frame) -> eyre::Result<()>;
}

impl<F> FrameProcessor for F
where
    F: Fn(&Frame) -> eyre::Result<()> + Send + Sync,
{
    fn process(&self, frame: &Frame) -> eyre::Result<()> {
        self(frame)
    }
}

/// A named processor, ready to be installed with [`Dispatcher::set_processor`].
pub struct Processor {
    name: String,
    inner: Box<dyn FrameProcessor>,
}

impl Processor {
    pub fn new(name: impl Into<String>, processor: impl FrameProcessor + 'static) -> Self {
        Self {
            name: name.into(),
            inner: Box::new(processor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor").field("name", &self.name).finish()
    }
}

/// What happened to a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the processing context
    Scheduled,
    /// Released immediately, no processor installed
    DroppedNoProcessor,
    /// Released immediately, the previous frame is still being processed
    DroppedBusy,
}

impl Delivery {
    pub fn is_dropped(self) -> bool {
        !matches!(self, Delivery::Scheduled)
    }
}

pub struct Dispatcher {
    processor: ArcSwapOption<Processor>,
    slot: Arc<InFlightSlot>,
    context: Arc<dyn ProcessingContext>,
    bridge: ErrorBridge,
    counters: Arc<Counters>,
    offload_prefix: String,
}

impl Dispatcher {
    pub fn new(context: Arc<dyn ProcessingContext>, bridge: ErrorBridge) -> Self {
        Self {
            processor: ArcSwapOption::empty(),
            slot: InFlightSlot::new(),
            context,
            bridge,
            counters: Arc::new(Counters::default()),
            offload_prefix: PipelineConfig::default().offload_thread_prefix,
        }
    }

    /// Build a dispatcher running processors on its own worker thread.
    #[instrument(skip(config, bridge))]
    pub fn with_worker(config: &PipelineConfig, bridge: ErrorBridge) -> Result<Self> {
        let worker =
            WorkerThread::spawn_pinned(config.processing_thread.clone(), config.processing_core)?;
        let mut dispatcher = Self::new(Arc::new(worker), bridge);
        dispatcher.offload_prefix = config.offload_thread_prefix.clone();
        Ok(dispatcher)
    }

    /// Replace the active processor. Takes effect from the next captured
    /// frame; an invocation already running keeps its processor.
    pub fn set_processor(&self, processor: Option<Processor>) {
        match &processor {
            Some(p) => debug!(processor = %p.name, "processor installed"),
            None => debug!("processor removed"),
        }
        self.processor.store(processor.map(Arc::new));
    }

    pub fn has_processor(&self) -> bool {
        self.processor.load().is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub fn bridge(&self) -> &ErrorBridge {
        &self.bridge
    }

    pub fn context_name(&self) -> &str {
        self.context.name()
    }

    /// Entry point for the producer. Takes over the frame's creation
    /// reference; the buffer goes back to the producer once every holder is
    /// done with it.
    ///
    /// A frame that was already released is refused with `UseAfterRelease`.
    pub fn on_frame_captured(&self, frame: Frame) -> Result<Delivery> {
        if !frame.is_valid() {
            return Err(PipelineError::UseAfterRelease {
                sequence: frame.sequence(),
            });
        }
        let capture = FrameLease::adopt(frame);
        Counters::bump(&self.counters.submitted);
        metrics::counter!("framepipe_frames_captured").increment(1);

        let Some(processor) = self.processor.load_full() else {
            trace!(sequence = capture.sequence(), "no processor, dropping frame");
            Counters::bump(&self.counters.dropped_no_processor);
            metrics::counter!("framepipe_frames_dropped", "reason" => "no_processor").increment(1);
            return Ok(Delivery::DroppedNoProcessor);
        };

        let Some(permit) = self.slot.try_acquire() else {
            trace!(sequence = capture.sequence(), "processor busy, dropping frame");
            Counters::bump(&self.counters.dropped_busy);
            metrics::counter!("framepipe_frames_dropped", "reason" => "busy").increment(1);
            return Ok(Delivery::DroppedBusy);
        };

        let lease = capture.lease()?;
        let bridge = self.bridge.clone();
        let counters = Arc::clone(&self.counters);
        let job: Job = Box::new(move || {
            // Counted when the job runs; a context may discard it unrun
            Counters::bump(&counters.delivered);
            metrics::counter!("framepipe_frames_delivered").increment(1);
            let sequence = lease.sequence();
            let failure = guarded(ErrorKind::ProcessorThrow, &processor.name, sequence, || {
                processor.inner.process(&lease)
            });
            Counters::bump(&counters.completed);
            if let Some(error) = failure {
                Counters::bump(&counters.failed);
                metrics::counter!("framepipe_processor_failures").increment(1);
                bridge.report(error);
            }
            // Release before the slot opens up for the next frame
            drop(lease);
            drop(permit);
        });

        if let Err(e) = self.context.execute(job) {
            warn!(sequence = capture.sequence(), "processing context rejected frame: {}", e);
            return Err(e);
        }
        Ok(Delivery::Scheduled)
    }

    /// Create an offload queue on its own worker thread, reporting failures
    /// through this dispatcher's bridge.
    pub fn offload_queue(&self, name: &str) -> Result<AsyncQueue> {
        let worker = WorkerThread::spawn(format!("{}-{}", self.offload_prefix, name))?;
        Ok(AsyncQueue::new(name, Arc::new(worker), self.bridge.clone()))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let processor = self.processor.load_full();
        f.debug_struct("Dispatcher")
            .field("processor", &processor.as_ref().map(|p| p.name.as_str()))
            .field("context", &self.context.name())
            .field("busy", &self.slot.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::pipeline::context::{InlineContext, TokioContext};
    use bytes::Bytes;
    use color_eyre::eyre::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn frame(sequence: u64, recycled: &Arc<AtomicUsize>) -> Frame {
        let recycled = Arc::clone(recycled);
        Frame::new(
            Bytes::from(vec![0u8; 4]),
            FrameMetadata::new(sequence, 2, 2, PixelFormat::Gray8),
            Arc::new(move |_: Bytes, _: &FrameMetadata| {
                recycled.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    fn inline_dispatcher() -> (Dispatcher, crate::pipeline::ErrorReceiver) {
        let (bridge, errors) = ErrorBridge::channel();
        (Dispatcher::new(Arc::new(InlineContext), bridge), errors)
    }

    #[test]
    fn test_no_processor_drops_and_releases() {
        let (dispatcher, errors) = inline_dispatcher();
        let recycled = Arc::new(AtomicUsize::new(0));
        let f = frame(1, &recycled);

        let outcome = dispatcher.on_frame_captured(f.clone()).unwrap();
        assert_eq!(outcome, Delivery::DroppedNoProcessor);
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
        assert!(!f.is_valid());
        assert!(errors.try_recv().is_none());
        assert_eq!(dispatcher.stats().dropped_no_processor, 1);
    }

    #[test]
    fn test_instant_processor_sees_every_frame() {
        let (dispatcher, errors) = inline_dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.set_processor(Some(Processor::new("collect", move |frame: &Frame| {
            assert_eq!(frame.ref_count(), 2);
            sink.lock().unwrap().push(frame.sequence());
            Ok(())
        })));

        let recycled = Arc::new(AtomicUsize::new(0));
        for seq in 0..20 {
            let outcome = dispatcher.on_frame_captured(frame(seq, &recycled)).unwrap();
            assert_eq!(outcome, Delivery::Scheduled);
        }

        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(recycled.load(Ordering::SeqCst), 20);
        let stats = dispatcher.stats();
        assert_eq!(stats.delivered, 20);
        assert_eq!(stats.dropped(), 0);
        assert!(errors.try_recv().is_none());
    }

    #[test]
    fn test_busy_slot_drops_new_frames() {
        let (bridge, _errors) = ErrorBridge::channel();
        let worker = WorkerThread::spawn("test-dispatch").unwrap();
        let dispatcher = Dispatcher::new(Arc::new(worker), bridge);

        let (started_tx, started_rx) = flume::bounded(1);
        let (resume_tx, resume_rx) = flume::bounded::<()>(1);
        dispatcher.set_processor(Some(Processor::new("blocking", move |_: &Frame| {
            started_tx.send(()).ok();
            resume_rx.recv().ok();
            Ok(())
        })));

        let recycled = Arc::new(AtomicUsize::new(0));
        assert_eq!(
            dispatcher.on_frame_captured(frame(1, &recycled)).unwrap(),
            Delivery::Scheduled
        );
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(dispatcher.is_busy());

        let second = frame(2, &recycled);
        assert_eq!(
            dispatcher.on_frame_captured(second.clone()).unwrap(),
            Delivery::DroppedBusy
        );
        assert!(!second.is_valid());
        assert_eq!(recycled.load(Ordering::SeqCst), 1);

        resume_tx.send(()).unwrap();
        drop(dispatcher);
        assert_eq!(recycled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_released_frame_is_refused() {
        let (dispatcher, errors) = inline_dispatcher();
        let recycled = Arc::new(AtomicUsize::new(0));
        let released = frame(1, &recycled);
        released.release().unwrap();

        // No processor installed
        assert!(matches!(
            dispatcher.on_frame_captured(released.clone()),
            Err(PipelineError::UseAfterRelease { sequence: 1 })
        ));
        assert_eq!(dispatcher.stats().dropped_no_processor, 0);

        // Processor installed and busy
        let (bridge, _busy_errors) = ErrorBridge::channel();
        let worker = WorkerThread::spawn("test-refuse").unwrap();
        let busy = Dispatcher::new(Arc::new(worker), bridge);
        let (started_tx, started_rx) = flume::bounded(1);
        let (resume_tx, resume_rx) = flume::bounded::<()>(1);
        busy.set_processor(Some(Processor::new("blocking", move |_: &Frame| {
            started_tx.send(()).ok();
            resume_rx.recv().ok();
            Ok(())
        })));
        busy.on_frame_captured(frame(2, &recycled)).unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            busy.on_frame_captured(released),
            Err(PipelineError::UseAfterRelease { sequence: 1 })
        ));
        assert_eq!(busy.stats().dropped_busy, 0);

        resume_tx.send(()).unwrap();
        drop(busy);
        assert_eq!(recycled.load(Ordering::SeqCst), 2);
        assert!(errors.try_recv().is_none());
    }

    #[test]
    fn test_swap_during_invocation_applies_to_next_frame() {
        let (bridge, errors) = ErrorBridge::channel();
        let worker = WorkerThread::spawn("test-swap").unwrap();
        let dispatcher = Dispatcher::new(Arc::new(worker), bridge);

        let (started_tx, started_rx) = flume::bounded(1);
        let (resume_tx, resume_rx) = flume::bounded::<()>(1);
        let (a_done_tx, a_done_rx) = flume::unbounded();
        dispatcher.set_processor(Some(Processor::new("a", move |frame: &Frame| {
            started_tx.send(()).ok();
            resume_rx.recv().ok();
            // Still holds a live reference after the swap
            a_done_tx.send((frame.sequence(), frame.is_valid())).ok();
            Ok(())
        })));

        let recycled = Arc::new(AtomicUsize::new(0));
        assert_eq!(
            dispatcher.on_frame_captured(frame(1, &recycled)).unwrap(),
            Delivery::Scheduled
        );
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let (b_tx, b_rx) = flume::unbounded();
        dispatcher.set_processor(Some(Processor::new("b", move |frame: &Frame| {
            b_tx.send(frame.sequence()).ok();
            Ok(())
        })));
        assert_eq!(
            dispatcher.on_frame_captured(frame(2, &recycled)).unwrap(),
            Delivery::DroppedBusy
        );

        resume_tx.send(()).unwrap();
        assert_eq!(a_done_rx.recv_timeout(Duration::from_secs(1)).unwrap(), (1, true));
        for _ in 0..200 {
            if !dispatcher.is_busy() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!dispatcher.is_busy());

        assert_eq!(
            dispatcher.on_frame_captured(frame(3, &recycled)).unwrap(),
            Delivery::Scheduled
        );
        assert_eq!(b_rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
        assert!(a_done_rx.try_recv().is_err());
        assert!(errors.try_recv().is_none());

        drop(dispatcher);
        assert_eq!(recycled.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_job_discarded_by_stopped_runtime_is_not_delivered() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let context = TokioContext::new("stopped", runtime.handle().clone());
        runtime.shutdown_background();

        let (bridge, _errors) = ErrorBridge::channel();
        let dispatcher = Dispatcher::new(Arc::new(context), bridge);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        dispatcher.set_processor(Some(Processor::new("never", move |_: &Frame| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        let recycled = Arc::new(AtomicUsize::new(0));
        dispatcher.on_frame_captured(frame(1, &recycled)).unwrap();
        for _ in 0..200 {
            if recycled.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(recycled.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_busy());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.stats().delivered, 0);
    }

    #[test]
    fn test_failure_is_reported_and_delivery_continues() {
        let (dispatcher, errors) = inline_dispatcher();
        dispatcher.set_processor(Some(Processor::new("flaky", |frame: &Frame| {
            if frame.sequence() == 1 {
                bail!("boom");
            }
            Ok(())
        })));

        let recycled = Arc::new(AtomicUsize::new(0));
        for seq in 0..4 {
            dispatcher.on_frame_captured(frame(seq, &recycled)).unwrap();
        }

        let report = errors.try_recv().expect("failure should be reported");
        assert_eq!(report.kind, ErrorKind::ProcessorThrow);
        assert_eq!(report.source, "flaky");
        assert_eq!(report.sequence, 1);
        assert!(report.message.contains("boom"));
        assert!(errors.try_recv().is_none());

        assert_eq!(recycled.load(Ordering::SeqCst), 4);
        let stats = dispatcher.stats();
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_panicking_processor_still_releases() {
        let (dispatcher, errors) = inline_dispatcher();
        dispatcher.set_processor(Some(Processor::new("panics", |_: &Frame| -> eyre::Result<()> {
            panic!("processor bug")
        })));

        let recycled = Arc::new(AtomicUsize::new(0));
        dispatcher.on_frame_captured(frame(9, &recycled)).unwrap();

        assert_eq!(recycled.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_busy());
        let report = errors.try_recv().unwrap();
        assert!(report.message.contains("processor bug"));
    }

    #[test]
    fn test_replacing_processor_affects_next_frame() {
        let (dispatcher, _errors) = inline_dispatcher();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.set_processor(Some(Processor::new("count", move |_: &Frame| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        let recycled = Arc::new(AtomicUsize::new(0));
        dispatcher.on_frame_captured(frame(1, &recycled)).unwrap();
        dispatcher.set_processor(None);
        assert!(!dispatcher.has_processor());
        assert_eq!(
            dispatcher.on_frame_captured(frame(2, &recycled)).unwrap(),
            Delivery::DroppedNoProcessor
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
