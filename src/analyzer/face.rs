use super::cascade::{CascadeModel, IntegralImage};
use crate::config::FaceConfig;
use crate::error::DetectionError;
use crate::frame::{BoundingBox, Frame};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

/// Overlap above which two raw hits are counted as the same face
const GROUP_IOU: f32 = 0.3;

/// A face found in one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    /// Share of supporting windows, in (0, 1)
    pub confidence: f32,
    /// Capture time of the frame the face was found in
    pub timestamp: DateTime<Utc>,
}

/// Face detection backend.
///
/// Implementations are pure functions of their inputs so they can run on a
/// blocking thread while the capture loop keeps ownership of everything else.
pub trait FaceDetector: Send + Sync {
    /// Scan `regions` of the frame (padded), or the whole frame when `None`
    fn detect(
        &self,
        frame: &Frame,
        regions: Option<&[BoundingBox]>,
    ) -> Result<Vec<FaceDetection>, DetectionError>;

    fn name(&self) -> &str;
}

/// Scan parameters for [`CascadeFaceDetector`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSettings {
    pub min_size: u32,
    pub scale_factor: f32,
    pub min_neighbors: u32,
    pub roi_padding: u32,
}

impl From<&FaceConfig> for ScanSettings {
    fn from(config: &FaceConfig) -> Self {
        Self {
            min_size: config.min_size,
            scale_factor: config.scale_factor,
            min_neighbors: config.min_neighbors,
            roi_padding: config.roi_padding,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from(&FaceConfig::default())
    }
}

/// Sliding-window Haar cascade over a scale pyramid
pub struct CascadeFaceDetector {
    model: CascadeModel,
    settings: ScanSettings,
}

impl CascadeFaceDetector {
    pub fn new(model: CascadeModel, settings: ScanSettings) -> Self {
        Self { model, settings }
    }

    /// Load the pretrained cascade named in the configuration
    pub fn from_config(config: &FaceConfig) -> Result<Self, DetectionError> {
        info!("Loading face cascade from {}", config.cascade_path);
        let model = CascadeModel::from_xml_file(&config.cascade_path)?;
        Ok(Self::new(model, ScanSettings::from(config)))
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Collect every window position inside `area` that passes the cascade
    fn scan_area(
        &self,
        integral: &IntegralImage,
        area: &BoundingBox,
        hits: &mut HashSet<BoundingBox>,
    ) {
        let base_w = self.model.window_width as f32;
        let base_h = self.model.window_height as f32;
        let scale_factor = self.settings.scale_factor.max(1.01);
        let mut scale = (self.settings.min_size as f32 / base_w).max(1.0 / base_w);

        loop {
            let win_w = (base_w * scale).round() as u32;
            let win_h = (base_h * scale).round() as u32;
            if win_w == 0 || win_h == 0 || win_w > area.width || win_h > area.height {
                break;
            }

            let step = ((scale * 1.5).round() as u32).max(1);
            let mut y = area.y;
            while y + win_h <= area.bottom() {
                let mut x = area.x;
                while x + win_w <= area.right() {
                    if self.model.evaluate(integral, x, y, scale) {
                        hits.insert(BoundingBox::new(x, y, win_w, win_h));
                    }
                    x += step;
                }
                y += step;
            }

            scale *= scale_factor;
        }
    }
}

impl FaceDetector for CascadeFaceDetector {
    fn detect(
        &self,
        frame: &Frame,
        regions: Option<&[BoundingBox]>,
    ) -> Result<Vec<FaceDetection>, DetectionError> {
        let gray = frame.to_gray_image()?;
        let (width, height) = gray.dimensions();
        let integral = IntegralImage::new(&gray);

        let areas: Vec<BoundingBox> = match regions {
            Some(regions) => regions
                .iter()
                .map(|r| r.pad(self.settings.roi_padding, width, height))
                .filter(|r| r.width > 0 && r.height > 0)
                .collect(),
            None => vec![BoundingBox::new(0, 0, width, height)],
        };

        let mut hits = HashSet::new();
        for area in &areas {
            self.scan_area(&integral, area, &mut hits);
        }

        let timestamp: DateTime<Utc> = frame.timestamp.into();
        let faces: Vec<FaceDetection> = group_hits(hits, self.settings.min_neighbors.max(1))
            .into_iter()
            .map(|(bbox, supporters)| FaceDetection {
                bbox,
                confidence: supporters as f32 / (supporters as f32 + 2.0),
                timestamp,
            })
            .collect();

        debug!(
            "Face scan of frame {} over {} area(s) found {} face(s)",
            frame.sequence,
            areas.len(),
            faces.len()
        );
        Ok(faces)
    }

    fn name(&self) -> &str {
        "cascade"
    }
}

/// Merge overlapping hits, keeping groups with at least `min_neighbors` members
fn group_hits(hits: HashSet<BoundingBox>, min_neighbors: u32) -> Vec<(BoundingBox, u32)> {
    let mut sorted: Vec<BoundingBox> = hits.into_iter().collect();
    sorted.sort_by_key(|b| (b.y, b.x, b.width));

    let mut groups: Vec<Vec<BoundingBox>> = Vec::new();
    for hit in sorted {
        match groups
            .iter_mut()
            .find(|group| group.iter().any(|member| member.iou(&hit) > GROUP_IOU))
        {
            Some(group) => group.push(hit),
            None => groups.push(vec![hit]),
        }
    }

    groups
        .into_iter()
        .filter(|group| group.len() as u32 >= min_neighbors)
        .map(|group| {
            let n = group.len() as u64;
            let (x, y, w, h) = group.iter().fold((0u64, 0u64, 0u64, 0u64), |acc, b| {
                (
                    acc.0 + b.x as u64,
                    acc.1 + b.y as u64,
                    acc.2 + b.width as u64,
                    acc.3 + b.height as u64,
                )
            });
            (
                BoundingBox::new((x / n) as u32, (y / n) as u32, (w / n) as u32, (h / n) as u32),
                n as u32,
            )
        })
        .collect()
}
