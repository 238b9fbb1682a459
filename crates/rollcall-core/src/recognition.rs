//! Per-face identification against the known dataset.

use crate::analyzer::DetectedFace;
use crate::types::{DistanceMatcher, KnownFace, Matcher, UNKNOWN_NAME};
use serde::Serialize;

const DEFAULT_DISTANCE_THRESHOLD: f32 = 1.0;
const DEFAULT_CONFIDENCE_BOOST: f32 = 15.0;
const MAX_CONFIDENCE: f32 = 100.0;

/// Acceptance rule for a nearest-distance match.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    /// A match is accepted only when the nearest distance is strictly below this.
    pub threshold: f32,
    /// Flat bonus added to the confidence of accepted matches, capped at 100.
    pub confidence_boost: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DISTANCE_THRESHOLD,
            confidence_boost: DEFAULT_CONFIDENCE_BOOST,
        }
    }
}

/// Outcome for one detected face. Request-scoped, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub name: String,
    /// 0–100; always 0 for an unknown face.
    pub confidence: f32,
    pub roll_no: Option<String>,
    /// `[top, right, bottom, left]` in the submitted image's coordinates.
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
}

impl Recognition {
    pub fn is_known(&self) -> bool {
        self.name != UNKNOWN_NAME
    }
}

/// Map a distance to a 0–100 score, rounded to two decimals.
pub fn confidence_from_distance(distance: f32) -> f32 {
    let raw = ((1.0 - distance) * 100.0).clamp(0.0, MAX_CONFIDENCE);
    (raw * 100.0).round() / 100.0
}

/// Identify one detected face against the dataset.
pub fn identify(
    gallery: &[KnownFace],
    face: &DetectedFace,
    policy: &MatchPolicy,
    image_width: u32,
    image_height: u32,
) -> Recognition {
    let bbox = face.bbox.to_trbl(image_width, image_height);
    let result = DistanceMatcher.compare(&face.embedding, gallery, policy.threshold);

    match result.index {
        Some(idx) if result.matched => {
            let known = &gallery[idx];
            let confidence = (confidence_from_distance(result.distance) + policy.confidence_boost)
                .min(MAX_CONFIDENCE);
            Recognition {
                name: known.name.clone(),
                confidence,
                roll_no: known.roll_no.clone(),
                bbox,
            }
        }
        _ => Recognition {
            name: UNKNOWN_NAME.to_string(),
            confidence: 0.0,
            roll_no: None,
            bbox,
        },
    }
}
