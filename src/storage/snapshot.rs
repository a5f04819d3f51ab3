use crate::error::StorageError;
use crate::frame::{encode_jpeg, BoundingBox, Frame};
use crate::overlay::{draw_boxes, TimestampStamp};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Writes annotated JPEG snapshots for qualifying events
pub struct SnapshotWriter {
    root: PathBuf,
    quality: u8,
    stamp: Option<Arc<TimestampStamp>>,
}

impl SnapshotWriter {
    pub fn new<P: Into<PathBuf>>(root: P, quality: u8) -> Self {
        Self {
            root: root.into(),
            quality,
            stamp: None,
        }
    }

    pub fn with_timestamp(mut self, stamp: TimestampStamp) -> Self {
        self.stamp = Some(Arc::new(stamp));
        self
    }

    /// `<root>/<YYYYMMDD>/<label>_<HHMMSS_mmm>_<sequence>.jpg`
    pub fn path_for(&self, label: &str, sequence: u64, timestamp: DateTime<Utc>) -> PathBuf {
        self.root.join(timestamp.format("%Y%m%d").to_string()).join(format!(
            "{}_{}_{}.jpg",
            label,
            timestamp.format("%H%M%S_%3f"),
            sequence
        ))
    }

    /// Render boxes and timestamp onto `frame`, then write it out
    pub async fn write(
        &self,
        frame: Arc<Frame>,
        motion_boxes: Vec<BoundingBox>,
        face_boxes: Vec<BoundingBox>,
        label: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<PathBuf, StorageError> {
        let path = self.path_for(label, frame.sequence, timestamp);
        let quality = self.quality;
        let stamp = self.stamp.clone();

        let jpeg = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, StorageError> {
            let mut image = frame.to_rgb_image().map_err(|e| StorageError::Encode {
                details: e.to_string(),
            })?;
            draw_boxes(&mut image, &motion_boxes, &face_boxes);
            if let Some(stamp) = stamp {
                stamp.stamp(&mut image, frame.timestamp);
            }
            encode_jpeg(&image, quality).map_err(|e| StorageError::Encode {
                details: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Encode {
            details: format!("snapshot task failed: {}", e),
        })??;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &jpeg).await?;

        debug!("Wrote {} byte snapshot to {}", jpeg.len(), path.display());
        Ok(path)
    }
}
