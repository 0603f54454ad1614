pub mod frame;
pub mod pool;
pub mod synthetic;

pub use frame::{BufferRecycler, Frame, FrameLease, FrameMetadata, Orientation, PixelFormat};
pub use pool::{BufferPool, PoolStats};
pub use synthetic::{CaptureReport, SyntheticCamera};
