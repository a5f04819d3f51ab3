pub mod analyzer;
pub mod app;
pub mod camera;
pub mod capture_loop;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod frame;
pub mod frame_buffer;
pub mod overlay;
pub mod recording;
pub mod stats;
pub mod storage;

#[cfg(feature = "streaming")]
pub mod streaming;

#[cfg(test)]
pub(crate) mod test_support;

pub use analyzer::{
    create_face_detector, CascadeFaceDetector, FaceDetection, FaceDetector, MotionDetector,
    MotionResult,
};
pub use app::{ComponentState, ShutdownReason, VisageOrchestrator};
pub use camera::{FrameSource, SourceSettings, SyntheticSource};
pub use capture_loop::{CaptureLoop, LoopState};
pub use config::{RuntimeConfig, RuntimeConfigDelta, VisageConfig};
pub use control::{Controller, FaceSnapshot};
pub use error::{Result, VisageError};
pub use events::{DetectionEvent, EventBus, EventKind, EventSink};
pub use frame::{BoundingBox, Frame, PixelFormat};
pub use frame_buffer::FrameBuffer;
pub use recording::RecordingSession;
pub use stats::{StatsRegistry, StatsSnapshot};
pub use storage::{EventStore, JsonlEventStore, MemoryEventStore, SnapshotWriter};

#[cfg(feature = "streaming")]
pub use streaming::StreamServer;
