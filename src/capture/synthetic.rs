//! Paced synthetic frame source
//!
//! Stands in for a camera session: produces frames of the configured
//! geometry at a fixed rate, drawing buffers from a recycling pool, and hands
//! them to a [`Dispatcher`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use super::frame::{Frame, FrameMetadata};
use super::pool::BufferPool;
use crate::pipeline::{Delivery, Dispatcher};
use crate::CaptureConfig;

/// Synthetic capture source
pub struct SyntheticCamera {
    config: CaptureConfig,
    pool: Arc<BufferPool>,
    sequence: u64,
    stop: Arc<AtomicBool>,
}

/// Outcome counts of one [`SyntheticCamera::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub captured: u64,
    pub scheduled: u64,
    pub dropped_busy: u64,
    pub dropped_no_processor: u64,
    pub rejected: u64,
    pub elapsed: Duration,
}

impl CaptureReport {
    pub fn dropped(&self) -> u64 {
        self.dropped_busy + self.dropped_no_processor
    }
}

impl SyntheticCamera {
    pub fn new(config: CaptureConfig) -> Self {
        let buffer_size = config.format.frame_size(config.width, config.height);
        let pool = BufferPool::new(config.buffer_count as usize, buffer_size);
        Self {
            config,
            pool,
            sequence: 0,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Flag that ends a running [`run`](Self::run) early when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.fps.max(1) as f64)
    }

    /// Capture one frame. Pixel values follow the sequence number so
    /// consecutive frames differ.
    pub fn next_frame(&mut self) -> Frame {
        let mut buffer = self.pool.acquire();
        buffer.fill((self.sequence % 256) as u8);

        let meta = FrameMetadata::new(
            self.sequence,
            self.config.width,
            self.config.height,
            self.config.format,
        )
        .with_orientation(self.config.orientation)
        .with_mirrored(self.config.mirrored);
        self.sequence += 1;

        Frame::new(buffer.freeze(), meta, self.pool.clone())
    }

    /// Capture `count` frames at the configured rate. Deadlines are absolute
    /// so a slow iteration does not shift the ones after it.
    #[instrument(skip(self, dispatcher))]
    pub fn run(&mut self, dispatcher: &Dispatcher, count: u64) -> CaptureReport {
        let interval = self.frame_interval();
        let start = Instant::now();
        let mut report = CaptureReport::default();

        info!(
            "Capturing {} frames at {} fps ({}x{} {:?})",
            count, self.config.fps, self.config.width, self.config.height, self.config.format
        );

        for i in 0..count {
            if self.stop.load(Ordering::Relaxed) {
                info!("Capture stopped after {} frames", i);
                break;
            }
            let deadline = start + interval.mul_f64(i as f64);
            if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }

            report.captured += 1;
            match dispatcher.on_frame_captured(self.next_frame()) {
                Ok(Delivery::Scheduled) => report.scheduled += 1,
                Ok(Delivery::DroppedBusy) => report.dropped_busy += 1,
                Ok(Delivery::DroppedNoProcessor) => report.dropped_no_processor += 1,
                Err(e) => {
                    warn!("Frame rejected: {}", e);
                    report.rejected += 1;
                }
            }
        }

        report.elapsed = start.elapsed();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::pipeline::{ErrorBridge, InlineContext, Processor};

    fn config(fps: u32) -> CaptureConfig {
        CaptureConfig {
            width: 8,
            height: 4,
            fps,
            format: PixelFormat::Gray8,
            buffer_count: 4,
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn test_frames_carry_sequence_and_geometry() {
        let mut camera = SyntheticCamera::new(config(30));
        let first = camera.next_frame();
        let second = camera.next_frame();
        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);
        assert_eq!(second.len().unwrap(), 32);
        assert_eq!(second.with_data(|d| d[0]).unwrap(), 1);
        assert_eq!(first.width().unwrap(), 8);
    }

    #[test]
    fn test_released_buffers_are_reused() {
        let (bridge, _errors) = ErrorBridge::channel();
        let dispatcher = Dispatcher::new(Arc::new(InlineContext), bridge);
        dispatcher.set_processor(Some(Processor::new("noop", |_: &Frame| Ok(()))));

        let mut camera = SyntheticCamera::new(config(1000));
        let report = camera.run(&dispatcher, 10);

        assert_eq!(report.scheduled, 10);
        let stats = camera.pool().stats();
        assert_eq!(stats.recycled, 10);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 9);
    }

    #[test]
    fn test_stop_handle_ends_run() {
        let (bridge, _errors) = ErrorBridge::channel();
        let dispatcher = Dispatcher::new(Arc::new(InlineContext), bridge);
        let mut camera = SyntheticCamera::new(config(1000));
        camera.stop_handle().store(true, Ordering::Relaxed);
        let report = camera.run(&dispatcher, 10);
        assert_eq!(report.captured, 0);
    }
}
