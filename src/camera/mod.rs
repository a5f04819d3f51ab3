#[cfg(all(feature = "camera", target_os = "linux"))]
mod v4l2;
mod source;
mod synthetic;

#[cfg(test)]
mod tests;

use crate::config::{CameraConfig, SourceKind};
use crate::error::CaptureError;

#[cfg(all(feature = "camera", target_os = "linux"))]
pub use v4l2::V4l2Source;
pub use source::{FrameSource, SourceSettings};
pub use synthetic::SyntheticSource;

/// Build the frame source selected in the configuration
pub fn create_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    match config.source {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new())),
        #[cfg(all(feature = "camera", target_os = "linux"))]
        SourceKind::V4l2 => Ok(Box::new(V4l2Source::new(config.device_index))),
        #[cfg(not(all(feature = "camera", target_os = "linux")))]
        SourceKind::V4l2 => Err(CaptureError::DeviceUnavailable {
            details: "V4L2 capture requires the `camera` feature on Linux".to_string(),
        }),
    }
}
