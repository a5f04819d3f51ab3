use crate::frame::BoundingBox;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MotionStarted,
    MotionStopped,
    Face,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MotionStarted => "motion_started",
            EventKind::MotionStopped => "motion_stopped",
            EventKind::Face => "face",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something worth telling the outside world about. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Sequence of the frame that triggered the event
    pub frame_sequence: u64,
    /// Motion regions, or face boxes for `face` events
    pub regions: Vec<BoundingBox>,
    pub total_area: u64,
    /// Best face confidence, `face` events only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Saved snapshot, when one was written
    pub image_path: Option<PathBuf>,
}

impl DetectionEvent {
    pub fn new(
        kind: EventKind,
        timestamp: DateTime<Utc>,
        frame_sequence: u64,
        regions: Vec<BoundingBox>,
        total_area: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp,
            frame_sequence,
            regions,
            total_area,
            confidence: None,
            image_path: None,
        }
    }

    /// Human-readable one-liner for logs and notifications
    pub fn description(&self) -> String {
        match self.kind {
            EventKind::MotionStarted => format!(
                "Motion started in {} region(s), area {}",
                self.regions.len(),
                self.total_area
            ),
            EventKind::MotionStopped => "Motion stopped".to_string(),
            EventKind::Face => format!(
                "{} face(s) detected (confidence {:.2})",
                self.regions.len(),
                self.confidence.unwrap_or_default()
            ),
        }
    }
}
