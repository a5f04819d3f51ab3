use super::face::{FaceDetection, FaceDetector, ScanSettings};
use crate::config::FaceConfig;
use crate::error::DetectionError;
use crate::frame::{BoundingBox, Frame};
use chrono::{DateTime, Utc};
use opencv::core::{self, Mat, Rect, Scalar, Size, Vector};
use opencv::prelude::*;
use opencv::{imgproc, objdetect};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Face detection through OpenCV's own `CascadeClassifier`
pub struct OpenCvFaceDetector {
    classifier: Mutex<objdetect::CascadeClassifier>,
    settings: ScanSettings,
}

impl OpenCvFaceDetector {
    pub fn from_config(config: &FaceConfig) -> Result<Self, DetectionError> {
        info!("Loading OpenCV face cascade from {}", config.cascade_path);
        let classifier =
            objdetect::CascadeClassifier::new(&config.cascade_path).map_err(cv_error)?;
        if classifier.empty().map_err(cv_error)? {
            return Err(DetectionError::Model {
                details: format!("no cascade could be loaded from {}", config.cascade_path),
            });
        }

        Ok(Self {
            classifier: Mutex::new(classifier),
            settings: ScanSettings::from(config),
        })
    }

    fn equalized(&self, frame: &Frame) -> Result<Mat, DetectionError> {
        let gray = frame.to_gray_image()?;
        let (width, height) = gray.dimensions();

        let mut src = Mat::new_rows_cols_with_default(
            height as i32,
            width as i32,
            core::CV_8UC1,
            Scalar::all(0.0),
        )
        .map_err(cv_error)?;
        src.data_bytes_mut()
            .map_err(cv_error)?
            .copy_from_slice(gray.as_raw());

        let mut equalized = Mat::default();
        imgproc::equalize_hist(&src, &mut equalized).map_err(cv_error)?;
        Ok(equalized)
    }
}

impl FaceDetector for OpenCvFaceDetector {
    fn detect(
        &self,
        frame: &Frame,
        regions: Option<&[BoundingBox]>,
    ) -> Result<Vec<FaceDetection>, DetectionError> {
        let image = self.equalized(frame)?;
        let (width, height) = (frame.width, frame.height);

        let areas: Vec<BoundingBox> = match regions {
            Some(regions) => regions
                .iter()
                .map(|r| r.pad(self.settings.roi_padding, width, height))
                .filter(|r| r.width > 0 && r.height > 0)
                .collect(),
            None => vec![BoundingBox::new(0, 0, width, height)],
        };

        let timestamp: DateTime<Utc> = frame.timestamp.into();
        let min = self.settings.min_size as i32;
        let mut classifier = self.classifier.lock();
        let mut faces = Vec::new();

        for area in &areas {
            let rect = Rect::new(
                area.x as i32,
                area.y as i32,
                area.width as i32,
                area.height as i32,
            );
            let patch = Mat::roi(&image, rect)
                .and_then(|roi| roi.try_clone())
                .map_err(cv_error)?;

            let mut rects = Vector::<Rect>::new();
            let mut neighbors = Vector::<i32>::new();
            classifier
                .detect_multi_scale2(
                    &patch,
                    &mut rects,
                    &mut neighbors,
                    self.settings.scale_factor as f64,
                    self.settings.min_neighbors as i32,
                    0,
                    Size::new(min, min),
                    Size::default(),
                )
                .map_err(cv_error)?;

            for (found, support) in rects.iter().zip(neighbors.iter()) {
                let support = support.max(1) as f32;
                faces.push(FaceDetection {
                    bbox: BoundingBox::new(
                        area.x + found.x.max(0) as u32,
                        area.y + found.y.max(0) as u32,
                        found.width.max(0) as u32,
                        found.height.max(0) as u32,
                    ),
                    confidence: support / (support + 2.0),
                    timestamp,
                });
            }
        }

        debug!(
            "OpenCV face scan of frame {} over {} area(s) found {} face(s)",
            frame.sequence,
            areas.len(),
            faces.len()
        );
        Ok(faces)
    }

    fn name(&self) -> &str {
        "opencv"
    }
}

fn cv_error(e: opencv::Error) -> DetectionError {
    DetectionError::Model {
        details: e.to_string(),
    }
}
