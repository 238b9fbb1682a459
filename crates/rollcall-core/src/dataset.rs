//! Known-person dataset: directory loader and versioned in-memory snapshot.
//!
//! Layout on disk:
//!
//! ```text
//! dataset/
//!   alice/
//!     roll_no.txt      (optional, e.g. "42")
//!     front.jpg
//!     side.png
//!   bob/
//!     1.jpeg
//! ```
//!
//! Loading is best-effort: unreadable directories, sidecars and images are
//! logged and skipped.

use crate::analyzer::FaceAnalyzer;
use crate::types::KnownFace;
use arc_swap::ArcSwap;
use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const ROLL_NO_FILE: &str = "roll_no.txt";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Scan `dir` and encode the first face of every sample photo.
pub fn load_dataset(dir: &Path, analyzer: &mut dyn FaceAnalyzer) -> Vec<KnownFace> {
    let mut known = Vec::new();

    let person_dirs = match sorted_entries(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "dataset directory not readable");
            return known;
        }
    };

    for person_dir in person_dirs.into_iter().filter(|p| p.is_dir()) {
        let Some(name) = person_dir.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            tracing::warn!(path = %person_dir.display(), "skipping non-UTF-8 person directory");
            continue;
        };
        let roll_no = read_roll_no(&person_dir);

        let images = match sorted_entries(&person_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    path = %person_dir.display(),
                    error = %e,
                    "person directory not readable"
                );
                continue;
            }
        };

        for path in images.into_iter().filter(|p| is_supported_image(p)) {
            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "error loading dataset image"
                    );
                    continue;
                }
            };

            match analyzer.analyze(&image) {
                Ok(faces) => match faces.into_iter().next() {
                    Some(face) => known.push(KnownFace {
                        name: name.clone(),
                        roll_no: roll_no.clone(),
                        embedding: face.embedding,
                    }),
                    None => tracing::debug!(path = %path.display(), "no face in dataset image"),
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "error encoding dataset image"
                    );
                }
            }
        }
    }

    tracing::info!(
        path = %dir.display(),
        entries = known.len(),
        "dataset loaded"
    );
    known
}

/// Trimmed contents of `roll_no.txt`, or `None` when missing or blank.
fn read_roll_no(person_dir: &Path) -> Option<String> {
    let path = person_dir.join(ROLL_NO_FILE);
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(&path) {
        Ok(raw) => Some(raw.trim().to_string()).filter(|r| !r.is_empty()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "error reading roll number");
            None
        }
    }
}

fn is_supported_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

/// An immutable generation of the dataset.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    /// Increments on every reload; 0 is the empty startup snapshot.
    pub version: u64,
    pub loaded_at: DateTime<Local>,
    pub faces: Vec<KnownFace>,
}

impl DatasetSnapshot {
    fn empty() -> Self {
        Self { version: 0, loaded_at: Local::now(), faces: Vec::new() }
    }

    /// Name of every entry, one per encoded sample photo.
    pub fn names(&self) -> Vec<&str> {
        self.faces.iter().map(|f| f.name.as_str()).collect()
    }

    /// Number of distinct people.
    pub fn identity_count(&self) -> usize {
        self.faces.iter().map(|f| f.name.as_str()).collect::<BTreeSet<_>>().len()
    }

    /// Roll number recorded for `name`, taken from its first entry.
    pub fn roll_for(&self, name: &str) -> Option<&str> {
        self.faces
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.roll_no.as_deref())
    }
}

/// Process-wide dataset holder.
///
/// Readers take an `Arc` to the current snapshot and keep it for the whole
/// request; a reload builds the next snapshot separately and swaps it in,
/// so readers never see a half-built dataset.
pub struct DatasetCache {
    current: ArcSwap<DatasetSnapshot>,
    write: Mutex<()>,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(DatasetSnapshot::empty()),
            write: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<DatasetSnapshot> {
        self.current.load_full()
    }

    /// Publish `faces` as the next version and return it.
    pub fn replace(&self, faces: Vec<KnownFace>) -> Arc<DatasetSnapshot> {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(DatasetSnapshot {
            version: self.current.load().version + 1,
            loaded_at: Local::now(),
            faces,
        });
        self.current.store(Arc::clone(&next));
        tracing::info!(
            version = next.version,
            entries = next.faces.len(),
            "dataset snapshot published"
        );
        next
    }
}

impl Default for DatasetCache {
    fn default() -> Self {
        Self::new()
    }
}
