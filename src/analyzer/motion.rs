use crate::config::{MotionConfig, RuntimeConfig};
use crate::error::DetectionError;
use crate::frame::{BoundingBox, Frame};

use image::{imageops, GrayImage, Luma};
use imageproc::{
    distance_transform::Norm,
    filter::gaussian_blur_f32,
    morphology::{dilate, erode},
    region_labelling::{connected_components, Connectivity},
};
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// Radius of the opening (erode then dilate) applied to the foreground mask
const MORPH_RADIUS: u8 = 1;

/// Outcome of one motion check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionResult {
    /// `total_area` reached the configured threshold
    pub active: bool,
    /// Foreground regions above the noise floor, in full-frame coordinates
    pub regions: Vec<BoundingBox>,
    /// Foreground pixels across all regions, in full-frame pixels
    pub total_area: u64,
}

/// Everything the detector needs, merged from static and runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSettings {
    pub enabled: bool,
    pub threshold: u64,
    pub learning_rate: f32,
    pub check_interval: u32,
    pub update_background_when_disabled: bool,
    pub analysis_scale: u32,
    pub deviation_threshold: f32,
    pub min_variance: f32,
    pub min_region_area: u32,
    pub blur_sigma: f32,
}

impl MotionSettings {
    pub fn new(motion: &MotionConfig, runtime: &RuntimeConfig) -> Self {
        Self {
            enabled: runtime.motion_enabled,
            threshold: runtime.motion_threshold,
            learning_rate: runtime.learning_rate(),
            check_interval: runtime.motion_check_interval.max(1),
            update_background_when_disabled: runtime.update_background_when_disabled,
            analysis_scale: motion.analysis_scale.max(1),
            deviation_threshold: motion.deviation_threshold,
            min_variance: motion.min_variance,
            min_region_area: motion.min_region_area,
            blur_sigma: motion.blur_sigma,
        }
    }
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self::new(&MotionConfig::default(), &RuntimeConfig::default())
    }
}

/// Per-pixel running mean and variance of the empty scene
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
}

impl BackgroundModel {
    /// Seed the model from a first observation
    pub fn from_image(image: &GrayImage, initial_variance: f32) -> Self {
        let mean: Vec<f32> = image.as_raw().iter().map(|&v| v as f32).collect();
        let variance = vec![initial_variance; mean.len()];
        Self {
            width: image.width(),
            height: image.height(),
            mean,
            variance,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Fold a new observation into the model.
    ///
    /// The squared deviation feeding the variance is capped at `max_sq_dev`
    /// times the current variance.
    pub fn update(
        &mut self,
        image: &GrayImage,
        learning_rate: f32,
        min_variance: f32,
        max_sq_dev: f32,
    ) {
        let alpha = learning_rate.clamp(0.0, 0.999);
        for ((mean, variance), &pixel) in self
            .mean
            .iter_mut()
            .zip(self.variance.iter_mut())
            .zip(image.as_raw().iter())
        {
            let value = pixel as f32;
            let deviation = value - *mean;
            let cap = max_sq_dev * variance.max(min_variance);
            let sq = (deviation * deviation).min(cap);
            *mean += alpha * deviation;
            *variance = (1.0 - alpha) * *variance + alpha * sq;
        }
    }

    /// Binary mask (255 = foreground) of pixels deviating from the model
    pub fn foreground_mask(
        &self,
        image: &GrayImage,
        deviation_threshold: f32,
        min_variance: f32,
    ) -> GrayImage {
        let mask: Vec<u8> = self
            .mean
            .iter()
            .zip(self.variance.iter())
            .zip(image.as_raw().iter())
            .map(|((&mean, &variance), &pixel)| {
                let deviation = pixel as f32 - mean;
                if deviation * deviation > deviation_threshold * variance.max(min_variance) {
                    255
                } else {
                    0
                }
            })
            .collect();

        GrayImage::from_raw(self.width, self.height, mask)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }
}

#[derive(Debug, Clone, Copy)]
struct Blob {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    pixels: u64,
}

/// Background-subtraction motion detector.
///
/// Stateful: holds the background model and the last evaluated result.
/// The mask for a frame is always computed against the model as it stood
/// before that frame was learned.
pub struct MotionDetector {
    settings: MotionSettings,
    model: Option<BackgroundModel>,
    frames_since_check: u32,
    last_result: MotionResult,
}

impl MotionDetector {
    pub fn new(settings: MotionSettings) -> Self {
        info!(
            "Motion detector: threshold {}, learning rate {:.3}, every {} frames, scale 1/{}",
            settings.threshold,
            settings.learning_rate,
            settings.check_interval,
            settings.analysis_scale
        );
        Self {
            settings,
            model: None,
            frames_since_check: 0,
            last_result: MotionResult::default(),
        }
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    pub fn background_initialized(&self) -> bool {
        self.model.is_some()
    }

    /// Swap in new settings. The model survives unless the analysis geometry changed.
    pub fn apply_settings(&mut self, settings: MotionSettings) {
        if settings.analysis_scale != self.settings.analysis_scale
            || settings.blur_sigma != self.settings.blur_sigma
        {
            self.model = None;
        }
        if !settings.enabled {
            self.last_result = MotionResult::default();
        }
        if settings.check_interval != self.settings.check_interval {
            self.frames_since_check = 0;
        }
        self.settings = settings;
    }

    /// Forget the background, e.g. after the source was reopened
    pub fn reset(&mut self) {
        debug!("Resetting motion background model");
        self.model = None;
        self.frames_since_check = 0;
        self.last_result = MotionResult::default();
    }

    /// Classify one frame
    pub fn detect(&mut self, frame: &Frame) -> Result<MotionResult, DetectionError> {
        let analysis = self.prepare(frame)?;

        let needs_seed = self
            .model
            .as_ref()
            .map_or(true, |model| model.dimensions() != analysis.dimensions());
        if needs_seed {
            debug!(
                "Initializing background model at {}x{} from frame {}",
                analysis.width(),
                analysis.height(),
                frame.sequence
            );
            self.model = Some(BackgroundModel::from_image(
                &analysis,
                self.settings.min_variance,
            ));
            self.frames_since_check = 0;
            self.last_result = MotionResult::default();
            return Ok(MotionResult::default());
        }

        let Some(model) = self.model.as_mut() else {
            return Ok(MotionResult::default());
        };
        let settings = &self.settings;

        if !settings.enabled {
            if settings.update_background_when_disabled {
                model.update(
                    &analysis,
                    settings.learning_rate,
                    settings.min_variance,
                    settings.deviation_threshold,
                );
            }
            return Ok(MotionResult::default());
        }

        let evaluate = self.frames_since_check == 0;
        self.frames_since_check = (self.frames_since_check + 1) % settings.check_interval.max(1);

        let mask = if evaluate {
            Some(model.foreground_mask(
                &analysis,
                settings.deviation_threshold,
                settings.min_variance,
            ))
        } else {
            None
        };

        model.update(
            &analysis,
            settings.learning_rate,
            settings.min_variance,
            settings.deviation_threshold,
        );

        let Some(mask) = mask else {
            trace!("Reusing motion result for frame {}", frame.sequence);
            return Ok(self.last_result.clone());
        };

        let result = self.extract_regions(&mask, frame.width, frame.height);
        debug!(
            "Motion analysis of frame {}: {} regions, area {} (active: {})",
            frame.sequence,
            result.regions.len(),
            result.total_area,
            result.active
        );
        self.last_result = result.clone();
        Ok(result)
    }

    /// Grayscale, downscaled and blurred copy of the frame
    fn prepare(&self, frame: &Frame) -> Result<GrayImage, DetectionError> {
        let gray = frame.to_gray_image()?;
        let scale = self.settings.analysis_scale.max(1);

        let scaled = if scale > 1 {
            let width = (frame.width / scale).max(1);
            let height = (frame.height / scale).max(1);
            imageops::resize(&gray, width, height, imageops::FilterType::Triangle)
        } else {
            gray
        };

        if self.settings.blur_sigma > 0.0 {
            Ok(gaussian_blur_f32(&scaled, self.settings.blur_sigma))
        } else {
            Ok(scaled)
        }
    }

    fn extract_regions(
        &self,
        mask: &GrayImage,
        frame_width: u32,
        frame_height: u32,
    ) -> MotionResult {
        let cleaned = dilate(
            &erode(mask, Norm::LInf, MORPH_RADIUS),
            Norm::LInf,
            MORPH_RADIUS,
        );

        let labels = connected_components(&cleaned, Connectivity::Eight, Luma([0u8]));

        let mut blobs: HashMap<u32, Blob> = HashMap::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label.0[0];
            if label == 0 {
                continue;
            }
            blobs
                .entry(label)
                .and_modify(|b| {
                    b.min_x = b.min_x.min(x);
                    b.min_y = b.min_y.min(y);
                    b.max_x = b.max_x.max(x);
                    b.max_y = b.max_y.max(y);
                    b.pixels += 1;
                })
                .or_insert(Blob {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                    pixels: 1,
                });
        }

        let scale = self.settings.analysis_scale.max(1);
        let pixel_area = (scale as u64) * (scale as u64);

        let mut blobs: Vec<Blob> = blobs.into_values().collect();
        blobs.sort_by_key(|b| (b.min_y, b.min_x));

        let mut regions = Vec::new();
        let mut total_area = 0u64;
        for blob in blobs {
            let area = blob.pixels * pixel_area;
            if area < self.settings.min_region_area as u64 {
                continue;
            }
            total_area += area;
            regions.push(
                BoundingBox::new(
                    blob.min_x,
                    blob.min_y,
                    blob.max_x - blob.min_x + 1,
                    blob.max_y - blob.min_y + 1,
                )
                .scale(scale)
                .clamp_to(frame_width, frame_height),
            );
        }

        MotionResult {
            active: total_area >= self.settings.threshold,
            regions,
            total_area,
        }
    }
}
