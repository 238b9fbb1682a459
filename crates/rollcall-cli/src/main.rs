use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::enhance::{
    crop_face, encode_jpeg, enhance_for_detection, CROP_JPEG_QUALITY, DEFAULT_CROP_PADDING,
};
use rollcall_core::{
    identify, load_dataset, FaceAnalyzer, KnownFace, MatchPolicy, OnnxAnalyzer, Recognition,
};
use rollcall_store::{export, AttendanceStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the known-person dataset and list identities
    Dataset {
        /// Dataset root, one subdirectory per person
        #[arg(long, default_value = "dataset")]
        dir: PathBuf,
        /// Directory containing the ONNX models
        #[arg(long)]
        models: Option<PathBuf>,
    },
    /// Recognize faces in an image file without the server
    Recognize {
        /// Image to analyze
        image: PathBuf,
        #[arg(long, default_value = "dataset")]
        dir: PathBuf,
        #[arg(long)]
        models: Option<PathBuf>,
        /// Maximum distance for a match
        #[arg(long)]
        threshold: Option<f32>,
        /// Write a padded, enhanced JPEG crop of every face into this directory
        #[arg(long, value_name = "OUT")]
        save_crops: Option<PathBuf>,
    },
    /// Export recorded attendance
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        /// Attendance database (defaults to the user data directory)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    Json,
    Csv,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dataset { dir, models } => {
            let mut analyzer = load_analyzer(models)?;
            let faces = load_dataset(&dir, &mut analyzer);
            if faces.is_empty() {
                println!("No identities found in {}", dir.display());
                return Ok(());
            }
            for (name, (samples, roll_no)) in summarize(&faces) {
                let roll_no = roll_no.unwrap_or("-");
                println!("{name:<24} samples={samples:<3} roll_no={roll_no}");
            }
        }
        Commands::Recognize { image, dir, models, threshold, save_crops } => {
            let mut analyzer = load_analyzer(models)?;
            let gallery = load_dataset(&dir, &mut analyzer);

            let frame = image::open(&image)
                .with_context(|| format!("failed to open {}", image.display()))?
                .to_rgb8();
            let (width, height) = frame.dimensions();
            let enhanced = enhance_for_detection(&frame);
            let detected = analyzer.analyze(&enhanced)?;

            let mut policy = MatchPolicy::default();
            if let Some(t) = threshold {
                policy.threshold = t;
            }
            let faces: Vec<Recognition> = detected
                .iter()
                .map(|face| identify(&gallery, face, &policy, width, height))
                .collect();

            if let Some(out) = save_crops {
                std::fs::create_dir_all(&out)
                    .with_context(|| format!("failed to create {}", out.display()))?;
                for (i, face) in faces.iter().enumerate() {
                    let Some(crop) = crop_face(&enhanced, face.bbox, DEFAULT_CROP_PADDING) else {
                        tracing::warn!(index = i, bbox = ?face.bbox, "face box has no area");
                        continue;
                    };
                    let path = out.join(crop_file_name(i, &face.name));
                    std::fs::write(&path, encode_jpeg(&crop, CROP_JPEG_QUALITY)?)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), "crop saved");
                }
            }

            let report = serde_json::json!({ "faces": faces });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Export { format, db, output } => {
            let db = db.unwrap_or_else(rollcall_core::default_db_path);
            let records = open_existing_store(&db)?.list()?;

            let body = match format {
                ExportFormat::Json => {
                    serde_json::to_string_pretty(&export::to_json(&records)?)? + "\n"
                }
                ExportFormat::Csv => export::to_csv(&records),
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, body)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Wrote {} records to {}", records.len(), path.display());
                }
                None => print!("{body}"),
            }
        }
    }

    Ok(())
}

fn load_analyzer(models: Option<PathBuf>) -> Result<OnnxAnalyzer> {
    let dir = models.unwrap_or_else(rollcall_core::default_model_dir);
    OnnxAnalyzer::load(&dir)
        .with_context(|| format!("failed to load models from {}", dir.display()))
}

/// Open an attendance database for reading without creating one.
fn open_existing_store(db: &Path) -> Result<AttendanceStore> {
    if !db.is_file() {
        bail!("attendance database not found: {}", db.display());
    }
    AttendanceStore::open(db).with_context(|| format!("failed to open {}", db.display()))
}

/// Sample count and roll number per identity, sorted by name.
fn summarize(faces: &[KnownFace]) -> BTreeMap<&str, (usize, Option<&str>)> {
    let mut summary = BTreeMap::new();
    for face in faces {
        let entry = summary.entry(face.name.as_str()).or_insert((0, face.roll_no.as_deref()));
        entry.0 += 1;
    }
    summary
}

fn crop_file_name(index: usize, name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("face_{index:02}_{stem}.jpg")
}
