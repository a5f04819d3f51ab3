use crate::error::StreamError;
use crate::frame::{encode_jpeg, BoundingBox, Frame};
use crate::overlay::draw_box;
use bytes::Bytes;
use image::{Rgb, RgbImage};
use std::sync::Arc;
use tracing::{debug, trace};

const PLACEHOLDER_BACKGROUND: Rgb<u8> = Rgb([24, 24, 24]);
const PLACEHOLDER_FRAME: Rgb<u8> = Rgb([96, 96, 96]);

/// Encode a frame as JPEG on the blocking pool
pub async fn prepare_frame_for_streaming(
    frame: Arc<Frame>,
    quality: u8,
) -> Result<Bytes, StreamError> {
    let sequence = frame.sequence;
    let jpeg = tokio::task::spawn_blocking(move || frame.encode_jpeg(quality))
        .await
        .map_err(|e| StreamError::Encode {
            sequence,
            details: e.to_string(),
        })?
        .map_err(|e| StreamError::Encode {
            sequence,
            details: e.to_string(),
        })?;

    trace!("Encoded frame {} for streaming ({} bytes)", sequence, jpeg.len());
    Ok(Bytes::from(jpeg))
}

/// Dark frame with a grey border, sent while no camera frame exists yet
pub fn encode_placeholder(width: u32, height: u32, quality: u8) -> Result<Vec<u8>, StreamError> {
    let (width, height) = (width.max(16), height.max(16));
    let mut image = RgbImage::from_pixel(width, height, PLACEHOLDER_BACKGROUND);
    draw_box(
        &mut image,
        &BoundingBox::new(width / 8, height / 8, width * 3 / 4, height * 3 / 4),
        PLACEHOLDER_FRAME,
    );

    let jpeg = encode_jpeg(&image, quality).map_err(|e| StreamError::Encode {
        sequence: 0,
        details: e.to_string(),
    })?;

    debug!(
        "Created placeholder JPEG for {}x{} ({} bytes)",
        width,
        height,
        jpeg.len()
    );
    Ok(jpeg)
}
