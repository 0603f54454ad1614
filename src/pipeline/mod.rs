pub mod bridge;
pub mod context;
pub mod dispatcher;
pub mod offload;
pub mod slot;
pub mod throttle;

pub use bridge::{ErrorBridge, ErrorKind, ErrorReceiver, ProcessingError};
pub use context::{InlineContext, Job, ProcessingContext, TokioContext, WorkerThread};
pub use dispatcher::{Delivery, Dispatcher, FrameProcessor, Processor};
pub use offload::{AsyncQueue, Enqueued};
pub use slot::PipelineStats;
pub use throttle::TargetFps;
