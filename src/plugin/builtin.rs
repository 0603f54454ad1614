//! Plugins shipped with the crate.

use std::sync::Arc;

use color_eyre::eyre::{self, bail, eyre};
use serde_json::{json, Value};

use super::{FrameProcessorPlugin, PluginArgs, PluginOptions, PluginRegistry};
use crate::capture::{Frame, PixelFormat};

pub const FRAME_INFO: &str = "frame_info";
pub const LUMINANCE: &str = "luminance";

/// Register every builtin plugin.
pub fn register_builtins(registry: &PluginRegistry) {
    registry.register(
        FRAME_INFO,
        |_: &PluginOptions| -> eyre::Result<Arc<dyn FrameProcessorPlugin>> {
            Ok(Arc::new(FrameInfo))
        },
    );
    registry.register(
        LUMINANCE,
        |options: &PluginOptions| -> eyre::Result<Arc<dyn FrameProcessorPlugin>> {
            Ok(Arc::new(Luminance::from_options(options)?))
        },
    );
}

/// Reports geometry, format and metadata of the frame.
pub struct FrameInfo;

impl FrameProcessorPlugin for FrameInfo {
    fn process(&self, frame: &Frame, _args: &PluginArgs) -> eyre::Result<Value> {
        let meta = frame.metadata()?;
        Ok(json!({
            "sequence": meta.sequence,
            "width": meta.width,
            "height": meta.height,
            "bytes_per_row": meta.stride,
            "planes": meta.format.planes(),
            "format": meta.format.as_str(),
            "orientation": meta.orientation.as_str(),
            "mirrored": meta.mirrored,
            "device_timestamp_ms": meta.device_timestamp.map(|t| t.as_secs_f64() * 1000.0),
            "metadata": meta.extra,
        }))
    }
}

/// Mean luma of the frame, sampling every `step`-th pixel.
///
/// Options: `step` (integer >= 1, default 1). Per-call args may override
/// `step` as well.
pub struct Luminance {
    step: usize,
}

impl Luminance {
    pub fn from_options(options: &PluginOptions) -> eyre::Result<Self> {
        Ok(Self {
            step: parse_step(options.get("step"))?.unwrap_or(1),
        })
    }
}

fn parse_step(value: Option<&Value>) -> eyre::Result<Option<usize>> {
    match value {
        None => Ok(None),
        Some(v) => match v.as_u64() {
            Some(step) if step >= 1 => Ok(Some(step as usize)),
            _ => Err(eyre!("step must be a positive integer, got {}", v)),
        },
    }
}

impl FrameProcessorPlugin for Luminance {
    fn process(&self, frame: &Frame, args: &PluginArgs) -> eyre::Result<Value> {
        let step = parse_step(args.get("step"))?.unwrap_or(self.step);
        let meta = frame.metadata()?;
        let width = meta.width as usize;
        let pixels = width * meta.height as usize;
        let stride = meta.stride as usize;
        let format = meta.format;
        if format.is_compressed() {
            bail!("luminance needs uncompressed frames, got {}", format.as_str());
        }
        let bpp = format.bytes_per_pixel() as usize;

        let (sum, samples) = frame.with_data(|data| {
            let mut sum = 0f64;
            let mut samples = 0u64;
            for pixel in (0..pixels).step_by(step) {
                // Rows may be padded past width * bpp
                let offset = (pixel / width) * stride + (pixel % width) * bpp;
                let luma = match format {
                    PixelFormat::Gray8 | PixelFormat::Nv12 | PixelFormat::Yuyv4 => {
                        data.get(offset).map(|y| *y as f64)
                    }
                    PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                        data.get(offset..offset + 3).map(|px| {
                            let (r, b) = if format == PixelFormat::Rgb24 {
                                (px[0], px[2])
                            } else {
                                (px[2], px[0])
                            };
                            0.299 * r as f64 + 0.587 * px[1] as f64 + 0.114 * b as f64
                        })
                    }
                    PixelFormat::Mjpeg => None,
                };
                let Some(luma) = luma else { break };
                sum += luma;
                samples += 1;
            }
            (sum, samples)
        })?;

        let mean = if samples > 0 { sum / samples as f64 } else { 0.0 };
        Ok(json!({ "mean": mean, "samples": samples }))
    }
}
