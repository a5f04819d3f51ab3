mod cascade;
mod face;
mod motion;
#[cfg(feature = "opencv")]
mod opencv;

pub use cascade::{
    CascadeModel, HaarFeature, IntegralImage, Stage, TreeNode, WeakClassifier, WeightedRect,
};
pub use face::{CascadeFaceDetector, FaceDetection, FaceDetector, ScanSettings};
pub use motion::{BackgroundModel, MotionDetector, MotionResult, MotionSettings};
#[cfg(feature = "opencv")]
pub use opencv::OpenCvFaceDetector;

use crate::config::{FaceBackend, FaceConfig};
use crate::error::DetectionError;
use std::sync::Arc;

/// Create the face detector selected by `config.backend`
pub fn create_face_detector(config: &FaceConfig) -> Result<Arc<dyn FaceDetector>, DetectionError> {
    match config.backend {
        FaceBackend::Native => Ok(Arc::new(CascadeFaceDetector::from_config(config)?)),
        #[cfg(feature = "opencv")]
        FaceBackend::Opencv => Ok(Arc::new(OpenCvFaceDetector::from_config(config)?)),
        #[cfg(not(feature = "opencv"))]
        FaceBackend::Opencv => Err(DetectionError::Model {
            details: "OpenCV face backend requires the 'opencv' feature".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_backend_needs_a_cascade_file() {
        let config = FaceConfig {
            cascade_path: "/nonexistent/cascade.xml".to_string(),
            ..FaceConfig::default()
        };
        assert!(matches!(
            create_face_detector(&config),
            Err(DetectionError::Model { .. })
        ));
    }

    #[test]
    fn test_native_backend_loads_opencv_xml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("frontalface.xml");
        std::fs::write(&path, cascade::TEST_CASCADE_XML).unwrap();

        let config = FaceConfig {
            cascade_path: path.to_string_lossy().into_owned(),
            ..FaceConfig::default()
        };
        let detector = create_face_detector(&config).unwrap();
        assert_eq!(detector.name(), "cascade");
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn test_opencv_backend_requires_feature() {
        let config = FaceConfig {
            backend: FaceBackend::Opencv,
            ..FaceConfig::default()
        };
        let err = create_face_detector(&config).err().unwrap();
        assert!(err.to_string().contains("'opencv' feature"));
    }
}
