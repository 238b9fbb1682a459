//! rollcall-core: face detection, encoding and dataset matching.
//!
//! Uses SCRFD for face detection and ArcFace for face encoding, both running
//! via ONNX Runtime for CPU inference. Frames are enhanced before detection
//! and matched against an in-memory dataset of known people.

pub mod alignment;
pub mod analyzer;
pub mod dataset;
pub mod detector;
pub mod enhance;
pub mod recognition;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{AnalyzerError, DetectedFace, FaceAnalyzer, OnnxAnalyzer};
pub use dataset::{load_dataset, DatasetCache, DatasetSnapshot};
pub use detector::FaceDetector;
pub use recognition::{identify, MatchPolicy, Recognition};
pub use recognizer::FaceRecognizer;
pub use types::{
    BoundingBox, DistanceMatcher, Embedding, KnownFace, MatchResult, Matcher, UNKNOWN_NAME,
};

/// Default directory holding the ONNX model files.
///
/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Default SQLite attendance database path.
pub fn default_db_path() -> PathBuf {
    data_dir().join("attendance.db")
}

/// Per-user data directory for rollcall (`$XDG_DATA_HOME/rollcall`).
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
