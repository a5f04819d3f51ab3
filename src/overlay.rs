use crate::error::{DetectionError, StorageError};
use crate::frame::{BoundingBox, Frame};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use std::time::SystemTime;
use tracing::{debug, warn};

const MOTION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const FACE_COLOR: Rgb<u8> = Rgb([255, 64, 64]);

/// Resolve configured timezone, falling back to UTC on parse errors
pub fn resolve_timezone(tz_name: &str) -> Tz {
    match tz_name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("Invalid timestamp timezone '{}', falling back to UTC", tz_name);
            chrono_tz::UTC
        }
    }
}

/// Outline `bbox` two pixels thick, clipped to the image
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    let clipped = bbox.clamp_to(width, height);
    if clipped.width == 0 || clipped.height == 0 {
        return;
    }

    draw_hollow_rect_mut(
        image,
        Rect::at(clipped.x as i32, clipped.y as i32).of_size(clipped.width, clipped.height),
        color,
    );
    if clipped.width > 2 && clipped.height > 2 {
        draw_hollow_rect_mut(
            image,
            Rect::at(clipped.x as i32 + 1, clipped.y as i32 + 1)
                .of_size(clipped.width - 2, clipped.height - 2),
            color,
        );
    }
}

/// Copy of the frame with motion regions in green and faces in red
pub fn render_overlay(
    frame: &Frame,
    motion_boxes: &[BoundingBox],
    face_boxes: &[BoundingBox],
) -> Result<Frame, DetectionError> {
    let mut image = frame.to_rgb_image()?;
    draw_boxes(&mut image, motion_boxes, face_boxes);

    Ok(Frame::from_rgb(frame.sequence, frame.timestamp, image))
}

pub fn draw_boxes(image: &mut RgbImage, motion_boxes: &[BoundingBox], face_boxes: &[BoundingBox]) {
    for bbox in motion_boxes {
        draw_box(image, bbox, MOTION_COLOR);
    }
    for bbox in face_boxes {
        draw_box(image, bbox, FACE_COLOR);
    }
}

/// Date and time text burned into the bottom-left corner of snapshots
pub struct TimestampStamp {
    font: Font<'static>,
    size: f32,
    timezone: Tz,
}

impl TimestampStamp {
    pub fn load(font_path: &str, size: f32, timezone: &str) -> Result<Self, StorageError> {
        let font_data = std::fs::read(font_path).map_err(|e| StorageError::Font {
            path: font_path.to_string(),
            details: e.to_string(),
        })?;

        let font = Font::try_from_vec(font_data).ok_or_else(|| StorageError::Font {
            path: font_path.to_string(),
            details: "not a usable TrueType font".to_string(),
        })?;

        Ok(Self {
            font,
            size: size.max(1.0),
            timezone: resolve_timezone(timezone),
        })
    }

    pub fn format(&self, timestamp: SystemTime) -> String {
        DateTime::<Utc>::from(timestamp)
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d %H:%M:%S%.3f %Z")
            .to_string()
    }

    pub fn stamp(&self, image: &mut RgbImage, timestamp: SystemTime) {
        let text = self.format(timestamp);
        let scale = Scale::uniform(self.size);

        let x: u32 = 10;
        let y: u32 = image.height().saturating_sub((self.size * 1.5) as u32);
        let (text_width, text_height) = text_size(scale, &self.font, &text);

        // Darken a backing box so the text reads on bright scenes
        for dy in 0..(text_height.max(0) as u32 + 10) {
            for dx in 0..(text_width.max(0) as u32 + 10) {
                let px = x.saturating_sub(5) + dx;
                let py = y.saturating_sub(5) + dy;
                if px < image.width() && py < image.height() {
                    let pixel = image.get_pixel(px, py);
                    let dimmed = Rgb([pixel[0] / 3, pixel[1] / 3, pixel[2] / 3]);
                    image.put_pixel(px, py, dimmed);
                }
            }
        }

        draw_text_mut(
            image,
            Rgb([255, 255, 255]),
            x as i32,
            y as i32,
            scale,
            &self.font,
            &text,
        );
        debug!("Stamped snapshot with {}", text);
    }
}
