//! Reference-counted frames shared between the capture source and processors.
//!
//! A [`Frame`] starts life with one reference owned by the pipeline. Every
//! component that hands the frame to another execution context takes its own
//! reference first ([`Frame::retain`] or, preferably, [`Frame::lease`]) and
//! gives it back when done. The release that takes the count from 1 to 0
//! returns the buffer to the producer's [`BufferRecycler`].

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{trace, warn};

use crate::error::{PipelineError, Result};

/// Producer-side hook receiving a buffer once no component references it.
pub trait BufferRecycler: Send + Sync {
    fn recycle(&self, buffer: Bytes, meta: &FrameMetadata);
}

impl<F> BufferRecycler for F
where
    F: Fn(Bytes, &FrameMetadata) + Send + Sync,
{
    fn recycle(&self, buffer: Bytes, meta: &FrameMetadata) {
        self(buffer, meta)
    }
}

/// Handle to one captured buffer.
///
/// Cloning the handle is cheap and does *not* take a reference; use
/// [`Frame::lease`] before handing the frame to another context.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    /// Taken exactly once, by whoever observes the 1 -> 0 transition
    buffer: ArcSwapOption<Bytes>,
    meta: FrameMetadata,
    refs: AtomicUsize,
    recycler: Arc<dyn BufferRecycler>,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    pub orientation: Orientation,
    pub mirrored: bool,
    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
    /// Auxiliary producer metadata (exposure, lens, ...)
    pub extra: HashMap<String, Value>,
}

impl FrameMetadata {
    pub fn new(sequence: u64, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            sequence,
            width,
            height,
            stride: width * format.bytes_per_pixel(),
            format,
            orientation: Orientation::default(),
            mirrored: false,
            timestamp: Instant::now(),
            device_timestamp: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_mirrored(mut self, mirrored: bool) -> Self {
        self.mirrored = mirrored;
        self
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_device_timestamp(mut self, timestamp: Duration) -> Self {
        self.device_timestamp = Some(timestamp);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
    Gray8,
}

impl PixelFormat {
    /// Bytes per pixel of the first plane. Compressed formats report 1.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv4 => 2,
            PixelFormat::Nv12 | PixelFormat::Gray8 | PixelFormat::Mjpeg => 1,
        }
    }

    pub fn planes(self) -> u32 {
        match self {
            PixelFormat::Nv12 => 2,
            _ => 1,
        }
    }

    /// Buffer size needed for one frame of the given geometry.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv12 => pixels * 3 / 2,
            // Rough upper bound for a compressed frame
            PixelFormat::Mjpeg => pixels / 4,
            other => pixels * other.bytes_per_pixel() as usize,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Yuyv4 => "yuyv4",
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Gray8 => "gray8",
        }
    }
}

/// Orientation of the buffer relative to the device's natural orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Orientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::PortraitUpsideDown => "portrait-upside-down",
            Orientation::LandscapeLeft => "landscape-left",
            Orientation::LandscapeRight => "landscape-right",
        }
    }
}

impl Frame {
    /// Wrap a captured buffer. The returned frame holds one reference, owned
    /// by the pipeline.
    pub fn new(buffer: Bytes, meta: FrameMetadata, recycler: Arc<dyn BufferRecycler>) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                buffer: ArcSwapOption::from_pointee(buffer),
                meta,
                refs: AtomicUsize::new(1),
                recycler,
            }),
        }
    }

    /// Wrap a buffer that has no pool to return to.
    pub fn unpooled(buffer: Bytes, meta: FrameMetadata) -> Self {
        Self::new(buffer, meta, Arc::new(|_: Bytes, _: &FrameMetadata| {}))
    }

    /// Sequence number assigned by the producer. Always available, also
    /// after release, so it can be used in logs.
    pub fn sequence(&self) -> u64 {
        self.inner.meta.sequence
    }

    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Whether the buffer is still owned by the pipeline.
    pub fn is_valid(&self) -> bool {
        self.ref_count() > 0
    }

    /// Take an additional reference.
    pub fn retain(&self) -> Result<()> {
        let mut current = self.inner.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(self.released());
            }
            match self.inner.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back one reference. The call that drops the count to zero hands
    /// the buffer to the producer.
    pub fn release(&self) -> Result<()> {
        let mut current = self.inner.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(self.released());
            }
            match self.inner.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            self.inner.return_buffer();
        }
        Ok(())
    }

    /// Retain and wrap the new reference in a guard that releases on drop.
    pub fn lease(&self) -> Result<FrameLease> {
        self.retain()?;
        Ok(FrameLease {
            frame: self.clone(),
        })
    }

    pub fn metadata(&self) -> Result<&FrameMetadata> {
        self.ensure_valid()?;
        Ok(&self.inner.meta)
    }

    pub fn width(&self) -> Result<u32> {
        Ok(self.metadata()?.width)
    }

    pub fn height(&self) -> Result<u32> {
        Ok(self.metadata()?.height)
    }

    pub fn bytes_per_row(&self) -> Result<u32> {
        Ok(self.metadata()?.stride)
    }

    pub fn format(&self) -> Result<PixelFormat> {
        Ok(self.metadata()?.format)
    }

    pub fn orientation(&self) -> Result<Orientation> {
        Ok(self.metadata()?.orientation)
    }

    pub fn is_mirrored(&self) -> Result<bool> {
        Ok(self.metadata()?.mirrored)
    }

    pub fn timestamp(&self) -> Result<Instant> {
        Ok(self.metadata()?.timestamp)
    }

    /// Run `f` over the buffer contents.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.ensure_valid()?;
        let buffer = self.inner.buffer.load();
        match buffer.as_deref() {
            Some(bytes) => Ok(f(bytes)),
            None => Err(self.released()),
        }
    }

    /// Copy the buffer contents out of the frame.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_data(|bytes| bytes.to_vec())
    }

    pub fn len(&self) -> Result<usize> {
        self.with_data(|bytes| bytes.len())
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(self.released())
        }
    }

    fn released(&self) -> PipelineError {
        PipelineError::UseAfterRelease {
            sequence: self.sequence(),
        }
    }
}

impl FrameInner {
    fn return_buffer(&self) {
        // swap() hands the buffer to a single caller even if two threads get here
        let Some(buffer) = self.buffer.swap(None) else {
            return;
        };
        let bytes = Arc::try_unwrap(buffer).unwrap_or_else(|shared| Bytes::clone(&shared));
        trace!(sequence = self.meta.sequence, "returning buffer to producer");
        self.recycler.recycle(bytes, &self.meta);
    }
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        let refs = *self.refs.get_mut();
        if refs > 0 {
            warn!(
                sequence = self.meta.sequence,
                refs, "frame dropped with outstanding references"
            );
            self.return_buffer();
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence())
            .field("refs", &self.ref_count())
            .field("width", &self.inner.meta.width)
            .field("height", &self.inner.meta.height)
            .field("format", &self.inner.meta.format)
            .finish()
    }
}

/// One owned reference to a [`Frame`], released when the lease is dropped.
pub struct FrameLease {
    frame: Frame,
}

impl FrameLease {
    /// Take over a reference the caller already owns, such as the one a
    /// freshly created frame starts with.
    pub fn adopt(frame: Frame) -> Self {
        Self { frame }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Err(e) = self.frame.release() {
            warn!("lease released twice: {}", e);
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameLease").field(&self.frame).finish()
    }
}
