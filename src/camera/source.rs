use crate::error::CaptureError;
use crate::frame::Frame;
use async_trait::async_trait;
use std::time::Duration;

/// Geometry and rate requested when opening a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A camera, or anything that behaves like one.
///
/// A source holds an exclusive device handle between `open` and `close`.
/// Implementations also release the handle when dropped so a cancelled
/// capture loop never leaks the device.
#[async_trait]
pub trait FrameSource: Send {
    /// Acquire the device. Reopening an open source closes it first.
    async fn open(&mut self, settings: SourceSettings) -> Result<(), CaptureError>;

    /// Next frame, waiting at most `timeout`.
    ///
    /// Returns [`CaptureError::Timeout`] instead of blocking past the deadline.
    async fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    /// Release the device. Closing a closed source is a no-op.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Short name used in logs
    fn name(&self) -> &str;
}
