use crate::error::DetectionError;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Pixel layout of raw frame data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit luminance
    Gray8,
    /// Packed 8-bit RGB
    Rgb24,
}

impl PixelFormat {
    /// Get bytes per pixel for the format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 => 3,
        }
    }
}

/// One captured image. Immutable once published; share it through `Arc<Frame>`.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub timestamp: SystemTime,
    /// Raw pixel data (shared ownership for cheap clones)
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel layout of `data`
    pub format: PixelFormat,
}

impl Frame {
    pub fn new(
        sequence: u64,
        timestamp: SystemTime,
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            data: Arc::new(data),
            width,
            height,
            format,
        }
    }

    pub fn from_rgb(sequence: u64, timestamp: SystemTime, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(
            sequence,
            timestamp,
            image.into_raw(),
            width,
            height,
            PixelFormat::Rgb24,
        )
    }

    /// Same pixels under a different sequence number
    pub fn with_sequence(&self, sequence: u64) -> Self {
        Self {
            sequence,
            ..self.clone()
        }
    }

    pub fn expected_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Validate frame data size against its declared geometry
    pub fn validate_size(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_size()
    }

    /// Get frame age in milliseconds
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn ensure_valid(&self) -> Result<(), DetectionError> {
        if self.validate_size() {
            Ok(())
        } else {
            Err(DetectionError::MalformedFrame {
                details: format!(
                    "frame {} is {}x{} {:?} but carries {} bytes (expected {})",
                    self.sequence,
                    self.width,
                    self.height,
                    self.format,
                    self.data.len(),
                    self.expected_size()
                ),
            })
        }
    }

    /// Luminance view of the frame (ITU-R 601 weights for RGB input)
    pub fn to_gray_image(&self) -> Result<GrayImage, DetectionError> {
        self.ensure_valid()?;

        let gray = match self.format {
            PixelFormat::Gray8 => self.data.as_ref().clone(),
            PixelFormat::Rgb24 => self
                .data
                .chunks_exact(3)
                .map(|px| {
                    ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8
                })
                .collect(),
        };

        GrayImage::from_raw(self.width, self.height, gray).ok_or_else(|| {
            DetectionError::MalformedFrame {
                details: format!("frame {} could not be viewed as grayscale", self.sequence),
            }
        })
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage, DetectionError> {
        self.ensure_valid()?;

        let rgb = match self.format {
            PixelFormat::Rgb24 => self.data.as_ref().clone(),
            PixelFormat::Gray8 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
        };

        RgbImage::from_raw(self.width, self.height, rgb).ok_or_else(|| {
            DetectionError::MalformedFrame {
                details: format!("frame {} could not be viewed as RGB", self.sequence),
            }
        })
    }

    /// Encode the frame as JPEG
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, image::ImageError> {
        let rgb = self
            .to_rgb_image()
            .map_err(|e| image::ImageError::IoError(std::io::Error::other(e.to_string())))?;
        encode_jpeg(&rgb, quality)
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut output = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut output, quality.clamp(1, 100));
    encoder.encode_image(image)?;
    Ok(output)
}

/// Axis-aligned rectangle in full-frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    /// Smallest box containing both
    pub fn union(&self, other: &BoundingBox) -> Self {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Self::new(x, y, right - x, bottom - y)
    }

    /// Multiply every coordinate by `factor`
    pub fn scale(&self, factor: u32) -> Self {
        Self::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    /// Grow by `padding` on every side, clipped to a `max_width` x `max_height` frame
    pub fn pad(&self, padding: u32, max_width: u32, max_height: u32) -> Self {
        let x = self.x.saturating_sub(padding);
        let y = self.y.saturating_sub(padding);
        let right = self.right().saturating_add(padding).min(max_width);
        let bottom = self.bottom().saturating_add(padding).min(max_height);
        Self::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }

    /// Clip to a `max_width` x `max_height` frame
    pub fn clamp_to(&self, max_width: u32, max_height: u32) -> Self {
        self.pad(0, max_width, max_height)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            0
        } else {
            (x1 - x0) as u64 * (y1 - y0) as u64
        }
    }

    /// Intersection over union, 0.0 for disjoint boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }

    pub fn distance_to(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}
