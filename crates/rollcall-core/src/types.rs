use serde::{Deserialize, Serialize};

/// Name reported for a face that matched nobody in the dataset.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in the pixel space of the submitted image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer `[top, right, bottom, left]` box, clamped to the image bounds.
    pub fn to_trbl(&self, image_width: u32, image_height: u32) -> [i32; 4] {
        let max_x = image_width as f32;
        let max_y = image_height as f32;
        let top = self.y.clamp(0.0, max_y).round() as i32;
        let left = self.x.clamp(0.0, max_x).round() as i32;
        let bottom = (self.y + self.height).clamp(0.0, max_y).round() as i32;
        let right = (self.x + self.width).clamp(0.0, max_x).round() as i32;
        [top, right, bottom, left]
    }
}

/// Face encoding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Euclidean distance between two encodings. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// One sample photo of a known person.
///
/// A person with several photos contributes several entries sharing the
/// same name and roll number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownFace {
    pub name: String,
    /// Raw roll number from the person's sidecar file, if any.
    pub roll_no: Option<String>,
    pub embedding: Embedding,
}

/// Result of matching a probe encoding against the dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest dataset entry (0.0 for an empty dataset).
    pub distance: f32,
    /// Index of the nearest entry, set only when `matched`.
    pub index: Option<usize>,
}

/// Strategy for comparing a probe encoding against the known faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[KnownFace], threshold: f32) -> MatchResult;
}

/// Nearest-distance matcher.
///
/// Scans every entry and keeps the first strict minimum, so ties resolve to
/// the lowest index. A match requires the minimum to be strictly below the
/// threshold.
pub struct DistanceMatcher;

impl Matcher for DistanceMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[KnownFace], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, known) in gallery.iter().enumerate() {
            let dist = probe.distance(&known.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                matched: true,
                distance: best_dist,
                index: Some(idx),
            },
            _ => MatchResult {
                matched: false,
                distance: if best_idx.is_none() { 0.0 } else { best_dist },
                index: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    fn known(name: &str, values: &[f32]) -> KnownFace {
        KnownFace { name: name.into(), roll_no: None, embedding: emb(values) }
    }

    #[test]
    fn test_distance_identical() {
        let a = emb(&[0.6, 0.8]);
        assert!(a.distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_distance_unit_axes() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!((a.distance(&b) - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_matcher_picks_nearest() {
        let gallery = vec![
            known("far", &[0.0, 1.0]),
            known("near", &[0.9, 0.1]),
            known("farther", &[-1.0, 0.0]),
        ];
        let result = DistanceMatcher.compare(&emb(&[1.0, 0.0]), &gallery, 0.5);
        assert!(result.matched);
        assert_eq!(result.index, Some(1));
    }

    #[test]
    fn test_matcher_tie_keeps_first() {
        let gallery = vec![known("first", &[1.0, 0.0]), known("second", &[1.0, 0.0])];
        let result = DistanceMatcher.compare(&emb(&[1.0, 0.0]), &gallery, 0.5);
        assert_eq!(result.index, Some(0));
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        let gallery = vec![known("edge", &[0.0, 0.5])];
        let result = DistanceMatcher.compare(&emb(&[0.0, 0.0]), &gallery, 0.5);
        assert!(!result.matched);
        assert!((result.distance - 0.5).abs() < 1e-6);
        assert_eq!(result.index, None);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let result = DistanceMatcher.compare(&emb(&[1.0, 0.0]), &[], 0.5);
        assert!(!result.matched);
        assert_eq!(result.distance, 0.0);
        assert_eq!(result.index, None);
    }

    #[test]
    fn test_to_trbl_clamps_to_image() {
        let bbox = BoundingBox {
            x: -5.0, y: 10.4, width: 50.0, height: 200.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(bbox.to_trbl(40, 100), [10, 40, 100, 0]);
    }
}
