//! Detection + encoding behind one seam.
//!
//! Everything upstream of matching goes through [`FaceAnalyzer`], so the
//! server and the dataset loader never touch ONNX sessions directly.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// A detected face together with its encoding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Finds faces in an RGB image and encodes each one.
///
/// Faces are returned in descending detector confidence.
pub trait FaceAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError>;
}

/// SCRFD + ArcFace analyzer.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir` (`det_10g.onnx`, `w600k_r50.onnx`).
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let boxes = self.detector.detect(image)?;
        tracing::debug!(faces = boxes.len(), "detection complete");

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            match self.recognizer.extract(image, &bbox) {
                Ok(embedding) => faces.push(DetectedFace { bbox, embedding }),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        confidence = bbox.confidence,
                        "skipping face that failed to encode"
                    );
                }
            }
        }
        Ok(faces)
    }
}
