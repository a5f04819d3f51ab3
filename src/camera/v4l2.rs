use super::source::{FrameSource, SourceSettings};
use crate::error::CaptureError;
use crate::frame::{Frame, PixelFormat};
use async_trait::async_trait;
use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

/// V4L2 camera read through a GStreamer pipeline ending in an appsink
pub struct V4l2Source {
    device_index: u32,
    pipeline: Option<Pipeline>,
    appsink: Option<AppSink>,
    frame_counter: u64,
    name: String,
}

impl V4l2Source {
    pub fn new(device_index: u32) -> Self {
        Self {
            device_index,
            pipeline: None,
            appsink: None,
            frame_counter: 0,
            name: format!("v4l2:/dev/video{}", device_index),
        }
    }

    /// Build GStreamer pipeline string producing packed RGB at the requested size
    fn build_pipeline_string(&self, settings: &SourceSettings) -> String {
        format!(
            "v4l2src device=/dev/video{} do-timestamp=true ! \
             decodebin ! videoconvert ! videoscale ! videorate ! \
             video/x-raw,format=RGB,width={},height={},framerate={}/1 ! \
             appsink name=sink sync=false max-buffers=2 drop=true emit-signals=false",
            self.device_index, settings.width, settings.height, settings.fps
        )
    }

    fn shutdown_pipeline(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                warn!("Failed to stop GStreamer pipeline for {}: {}", self.name, e);
            }
        }
    }

    fn sample_to_frame(&mut self, sample: gstreamer::Sample) -> Result<Frame, CaptureError> {
        let buffer = sample.buffer().ok_or_else(|| CaptureError::BadFormat {
            details: "No buffer in sample".to_string(),
        })?;

        let caps = sample.caps().ok_or_else(|| CaptureError::BadFormat {
            details: "No caps in sample".to_string(),
        })?;

        let video_info = VideoInfo::from_caps(caps).map_err(|e| CaptureError::BadFormat {
            details: format!("Failed to get video info: {}", e),
        })?;

        let width = video_info.width();
        let height = video_info.height();
        let stride = video_info.stride()[0] as usize;
        let row_bytes = width as usize * 3;

        let map = buffer.map_readable().map_err(|e| CaptureError::BadFormat {
            details: format!("Failed to map buffer: {}", e),
        })?;
        let bytes = map.as_slice();

        if !rows_fit(bytes.len(), stride, row_bytes, height as usize) {
            return Err(CaptureError::BadFormat {
                details: format!(
                    "buffer of {} bytes too small for {}x{} RGB (stride {})",
                    bytes.len(),
                    width,
                    height,
                    stride
                ),
            });
        }

        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            data.extend_from_slice(&bytes[start..start + row_bytes]);
        }

        self.frame_counter += 1;
        trace!(
            "Captured RGB frame {} ({}x{}, {} bytes)",
            self.frame_counter,
            width,
            height,
            data.len()
        );

        Ok(Frame::new(
            self.frame_counter,
            SystemTime::now(),
            data,
            width,
            height,
            PixelFormat::Rgb24,
        ))
    }
}

#[async_trait]
impl FrameSource for V4l2Source {
    async fn open(&mut self, settings: SourceSettings) -> Result<(), CaptureError> {
        self.shutdown_pipeline();

        gstreamer::init().map_err(|e| CaptureError::DeviceUnavailable {
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;

        let pipeline_desc = self.build_pipeline_string(&settings);
        info!("Creating GStreamer pipeline: {}", pipeline_desc);

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| CaptureError::Pipeline {
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| CaptureError::Pipeline {
                details: "Failed to downcast to Pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::Pipeline {
                details: "Failed to get appsink element".to_string(),
            })?
            .downcast::<AppSink>()
            .map_err(|_| CaptureError::Pipeline {
                details: "Failed to downcast to AppSink".to_string(),
            })?;

        if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(CaptureError::DeviceUnavailable {
                details: format!("Failed to start pipeline for {}: {}", self.name, e),
            });
        }

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        info!("GStreamer pipeline started for {}", self.name);
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let appsink = self.appsink.clone().ok_or(CaptureError::NotOpen)?;

        let pulled = tokio::task::spawn_blocking(move || {
            let sample = appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(
                timeout.as_millis() as u64,
            ));
            let eos = sample.is_none() && appsink.is_eos();
            (sample, eos)
        })
        .await
        .map_err(|e| CaptureError::Pipeline {
            details: format!("Sample pull task failed: {}", e),
        })?;

        match pulled {
            (Some(sample), _) => self.sample_to_frame(sample),
            (None, true) => Err(CaptureError::Disconnected {
                details: format!("{} reached end of stream", self.name),
            }),
            (None, false) => Err(CaptureError::Timeout { timeout }),
        }
    }

    async fn close(&mut self) {
        if self.pipeline.is_some() {
            debug!("Closing {}", self.name);
        }
        self.shutdown_pipeline();
    }

    fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.shutdown_pipeline();
    }
}

/// Whether `height` rows of `row_bytes` each, `stride` apart, fit in a buffer
/// of `len` bytes. Empty frames never fit.
fn rows_fit(len: usize, stride: usize, row_bytes: usize, height: usize) -> bool {
    if height == 0 || row_bytes == 0 || stride < row_bytes {
        return false;
    }
    stride
        .checked_mul(height - 1)
        .and_then(|offset| offset.checked_add(row_bytes))
        .is_some_and(|needed| needed <= len)
}

#[cfg(test)]
mod tests {
    use super::rows_fit;

    #[test]
    fn test_rows_fit() {
        // 4x2 RGB, padded to 16-byte rows, last row unpadded
        assert!(rows_fit(28, 16, 12, 2));
        assert!(!rows_fit(27, 16, 12, 2));
        assert!(!rows_fit(64, 8, 12, 2));
    }

    #[test]
    fn test_empty_frames_are_rejected() {
        assert!(!rows_fit(64, 16, 12, 0));
        assert!(!rows_fit(64, 16, 0, 2));
    }

    #[test]
    fn test_oversized_geometry_does_not_overflow() {
        assert!(!rows_fit(usize::MAX, usize::MAX, 12, 3));
    }
}
