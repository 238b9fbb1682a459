use rollcall_core::MatchPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_BIND: ([u8; 4], u16) = ([0, 0, 0, 0], 5000);
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:5000).
    pub bind: SocketAddr,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Known-person dataset root, one subdirectory per person.
    pub dataset_dir: PathBuf,
    /// Where marked attendance images are written, grouped by person.
    pub faces_dir: PathBuf,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Maximum distance for a match.
    pub distance_threshold: f32,
    /// Bonus added to the confidence of accepted matches.
    pub confidence_boost: f32,
    /// Request body limit for image uploads.
    pub max_upload_bytes: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = MatchPolicy::default();

        let bind = std::env::var("ROLLCALL_BIND")
            .ok()
            .and_then(|v| match v.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "invalid ROLLCALL_BIND, using default");
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(DEFAULT_BIND));

        Self {
            bind,
            model_dir: env_path("ROLLCALL_MODEL_DIR")
                .unwrap_or_else(rollcall_core::default_model_dir),
            dataset_dir: env_path("ROLLCALL_DATASET_DIR")
                .unwrap_or_else(|| PathBuf::from("dataset")),
            faces_dir: env_path("ROLLCALL_FACES_DIR").unwrap_or_else(|| PathBuf::from("faces")),
            db_path: env_path("ROLLCALL_DB_PATH").unwrap_or_else(rollcall_core::default_db_path),
            distance_threshold: env_f32("ROLLCALL_DISTANCE_THRESHOLD", defaults.threshold),
            confidence_boost: env_f32("ROLLCALL_CONFIDENCE_BOOST", defaults.confidence_boost),
            max_upload_bytes: env_usize("ROLLCALL_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.distance_threshold,
            confidence_boost: self.confidence_boost,
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
