use super::source::{FrameSource, SourceSettings};
use crate::error::CaptureError;
use crate::frame::Frame;
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Frames per cycle of the visitor pattern: the block walks across for
/// `ACTIVE_FRAMES` and the scene stays empty for the rest.
const PATTERN_PERIOD: u64 = 150;
const ACTIVE_FRAMES: u64 = 45;

/// Generated scene with a bright block that periodically crosses the frame.
///
/// Lets the whole pipeline run without hardware, and gives the motion
/// detector something to find.
pub struct SyntheticSource {
    settings: Option<SourceSettings>,
    frame_counter: u64,
    with_visitor: bool,
    background: Option<RgbImage>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            settings: None,
            frame_counter: 0,
            with_visitor: true,
            background: None,
        }
    }

    /// A source whose scene never changes
    pub fn still() -> Self {
        Self {
            with_visitor: false,
            ..Self::new()
        }
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_counter
    }

    fn render(&self, settings: &SourceSettings, background: &RgbImage) -> RgbImage {
        let mut image = background.clone();
        if !self.with_visitor {
            return image;
        }

        let phase = self.frame_counter % PATTERN_PERIOD;
        if phase >= ACTIVE_FRAMES {
            return image;
        }

        let block = (settings.width.min(settings.height) / 5).max(4);
        let travel = settings.width.saturating_sub(block);
        let x0 = (travel as u64 * phase / ACTIVE_FRAMES.max(1)) as u32;
        let y0 = settings.height.saturating_sub(block) / 2;

        for y in y0..(y0 + block).min(settings.height) {
            for x in x0..(x0 + block).min(settings.width) {
                image.put_pixel(x, y, Rgb([235, 220, 200]));
            }
        }
        image
    }
}

fn gradient_background(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let shade = 40 + ((x + y) * 60 / (width + height).max(1)) as u8;
        Rgb([shade, shade, shade.saturating_add(10)])
    })
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn open(&mut self, settings: SourceSettings) -> Result<(), CaptureError> {
        if settings.width == 0 || settings.height == 0 {
            return Err(CaptureError::BadFormat {
                details: format!("invalid resolution {}x{}", settings.width, settings.height),
            });
        }

        info!(
            "Opening synthetic source at {}x{} @ {}fps",
            settings.width, settings.height, settings.fps
        );
        self.background = Some(gradient_background(settings.width, settings.height));
        self.settings = Some(settings);
        Ok(())
    }

    async fn read(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
        let (settings, background) = match (&self.settings, &self.background) {
            (Some(settings), Some(background)) => (*settings, background),
            _ => return Err(CaptureError::NotOpen),
        };

        let image = self.render(&settings, background);
        self.frame_counter += 1;
        Ok(Frame::from_rgb(self.frame_counter, SystemTime::now(), image))
    }

    async fn close(&mut self) {
        if self.settings.take().is_some() {
            debug!("Closed synthetic source after {} frames", self.frame_counter);
        }
        self.background = None;
    }

    fn is_open(&self) -> bool {
        self.settings.is_some()
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
