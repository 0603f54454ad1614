//! Run part of a processor at a lower rate than the capture cadence.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::capture::Frame;
use crate::error::Result;

/// Lets a closure through at most `fps` times per second, measured on frame
/// capture timestamps rather than wall-clock time.
#[derive(Debug)]
pub struct TargetFps {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl TargetFps {
    /// `fps` of zero, negative, NaN or too small to represent lets only
    /// the first frame through.
    pub fn new(fps: f64) -> Self {
        let interval = if fps > 0.0 {
            Duration::try_from_secs_f64(1.0 / fps).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Call `f` if at least one interval passed since the last frame that was
    /// let through. Frames captured out of order never pass.
    pub fn run<R>(&self, frame: &Frame, f: impl FnOnce() -> R) -> Result<Option<R>> {
        let captured = frame.timestamp()?;
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                match captured.checked_duration_since(previous) {
                    Some(elapsed) if elapsed >= self.interval => {}
                    _ => return Ok(None),
                }
            }
            *last = Some(captured);
        }
        Ok(Some(f()))
    }
}
