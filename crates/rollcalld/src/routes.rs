//! HTTP surface: capture page, recognition, marking and exports.

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use crate::error::ApiError;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Local;
use rollcall_core::{identify, DatasetCache, Recognition};
use rollcall_store::{export, AttendanceRecord, AttendanceStore, NewAttendance};
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tower_http::trace::TraceLayer;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub dataset: Arc<DatasetCache>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/reload_dataset", post(reload_dataset))
        .route("/recognize", post(recognize))
        .route("/mark", post(mark))
        .route("/attendance/json", get(attendance_json))
        .route("/attendance/csv", get(attendance_csv))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn reload_dataset(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let faces = state.engine.load_dataset(state.config.dataset_dir.clone()).await?;
    let snapshot = state.dataset.replace(faces);

    tracing::info!(
        version = snapshot.version,
        identities = snapshot.identity_count(),
        "dataset reloaded"
    );
    Ok(Json(json!({
        "loaded": snapshot.faces.len(),
        "names": snapshot.names(),
        "version": snapshot.version,
    })))
}

async fn recognize(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, ApiError> {
    let form = UploadForm::read(multipart?).await?;
    let image = form.image.ok_or(ApiError::BadRequest("no image"))?;

    let analysis = match state.engine.analyze(image).await {
        Ok(analysis) => analysis,
        Err(EngineError::Decode(e)) => {
            tracing::debug!(error = %e, "rejecting undecodable upload");
            return Err(ApiError::BadRequest("bad image"));
        }
        Err(e) => return Err(e.into()),
    };

    // One snapshot for the whole request, even if a reload lands meanwhile.
    let snapshot = state.dataset.current();
    let policy = state.config.match_policy();
    let faces: Vec<Recognition> = analysis
        .faces
        .iter()
        .map(|face| identify(&snapshot.faces, face, &policy, analysis.width, analysis.height))
        .collect();

    tracing::debug!(
        faces = faces.len(),
        known = faces.iter().filter(|r| r.is_known()).count(),
        dataset_version = snapshot.version,
        "recognition complete"
    );
    Ok(Json(json!({ "faces": faces })))
}

async fn mark(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, ApiError> {
    const MISSING: ApiError = ApiError::BadRequest("name and image required");

    let form = UploadForm::read(multipart?).await?;
    let (Some(name), Some(image)) = (form.name, form.image) else {
        return Err(MISSING);
    };
    let safe_name = sanitize_name(&name);
    if safe_name.is_empty() {
        return Err(MISSING);
    }

    let confidence = form
        .confidence
        .and_then(|c| c.parse::<f64>().ok())
        .unwrap_or(0.0);
    let roll_no = form
        .roll_no
        .or_else(|| state.dataset.current().roll_for(&name).map(str::to_owned));

    let now = Local::now().naive_local();
    let dir = state.config.faces_dir.join(&safe_name);
    let stamp = now.format("%Y%m%d_%H%M%S").to_string();
    let path = save_image(&dir, &stamp, &image).await?;
    let image_path = path.display().to_string();

    let db_path = state.config.db_path.clone();
    let (entry_roll, entry_path) = (roll_no.clone(), image_path.clone());
    let outcome = tokio::task::spawn_blocking(move || {
        let mut store = AttendanceStore::open(&db_path)?;
        store.mark_unique(
            &NewAttendance {
                roll_no: entry_roll.as_deref(),
                name: &name,
                confidence,
                image_path: &entry_path,
            },
            now,
        )
    })
    .await??;

    Ok(Json(json!({
        "marked": outcome.inserted(),
        "path": image_path,
        "used_roll_no": roll_no,
    })))
}

async fn attendance_json(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let records = list_records(state.config.db_path.clone()).await?;
    Ok(Json(export::to_json(&records)?))
}

async fn attendance_csv(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let records = list_records(state.config.db_path.clone()).await?;
    let filename = export::csv_filename(Local::now().naive_local());

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        export::to_csv(&records),
    ))
}

async fn list_records(db_path: PathBuf) -> Result<Vec<AttendanceRecord>, ApiError> {
    let records =
        tokio::task::spawn_blocking(move || AttendanceStore::open(&db_path)?.list()).await??;
    Ok(records)
}

/// Write `bytes` to `<dir>/<stamp>.jpg`, or `<stamp>_<n>.jpg` when an earlier
/// mark in the same second already took that name.
async fn save_image(dir: &Path, stamp: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    for n in 0u32.. {
        let file_name = match n {
            0 => format!("{stamp}.jpg"),
            n => format!("{stamp}_{n}.jpg"),
        };
        let path = dir.join(file_name);
        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match open {
            Ok(mut file) => {
                file.write_all(bytes).await?;
                file.flush().await?;
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(ErrorKind::AlreadyExists.into())
}

/// Text and file parts of an upload. Blank text fields count as absent.
#[derive(Default)]
struct UploadForm {
    image: Option<Vec<u8>>,
    name: Option<String>,
    roll_no: Option<String>,
    confidence: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();

        while let Some(field) = multipart.next_field().await? {
            let Some(part) = field.name().map(str::to_owned) else {
                continue;
            };
            match part.as_str() {
                "image" => {
                    let bytes = field.bytes().await?;
                    form.image = (!bytes.is_empty()).then(|| bytes.to_vec());
                }
                "name" => form.name = non_blank(field.text().await?),
                "roll_no" => form.roll_no = non_blank(field.text().await?),
                "confidence" => form.confidence = non_blank(field.text().await?),
                _ => {}
            }
        }
        Ok(form)
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Directory-safe form of a person's name.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use image::{ImageFormat, RgbImage};
    use rollcall_core::{AnalyzerError, BoundingBox, DetectedFace, Embedding, FaceAnalyzer};
    use std::io::Cursor;
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "rollcall-test-boundary";

    /// Encodes a face by image width, so enhancement never changes identity:
    /// 40 px wide is one person, 60 px another, anything under 20 px has no face.
    struct WidthAnalyzer;

    impl FaceAnalyzer for WidthAnalyzer {
        fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
            let (w, h) = image.dimensions();
            if w < 20 {
                return Ok(Vec::new());
            }
            let values = if w == 40 { vec![1.0, 0.0] } else { vec![0.0, 1.0] };
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: w as f32,
                    height: h as f32,
                    confidence: 0.9,
                    landmarks: None,
                },
                embedding: Embedding { values, model_version: None },
            }])
        }
    }

    struct Harness {
        _tmp: TempDir,
        dataset_dir: PathBuf,
        faces_dir: PathBuf,
        app: Router,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let dataset_dir = tmp.path().join("dataset");
        let faces_dir = tmp.path().join("faces");
        std::fs::create_dir_all(&dataset_dir).unwrap();

        let config = Config {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            model_dir: tmp.path().join("models"),
            dataset_dir: dataset_dir.clone(),
            faces_dir: faces_dir.clone(),
            db_path: tmp.path().join("db/attendance.db"),
            distance_threshold: 1.0,
            confidence_boost: 15.0,
            max_upload_bytes: 1024 * 1024,
        };
        let state = AppState {
            engine: spawn_engine(Box::new(WidthAnalyzer)).unwrap(),
            dataset: Arc::new(DatasetCache::new()),
            config: Arc::new(config),
        };

        Harness { _tmp: tmp, dataset_dir, faces_dir, app: router(state) }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn add_person(dataset: &Path, name: &str, roll_no: Option<&str>, width: u32) {
        let dir = dataset.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sample.png"), png(width, 30)).unwrap();
        if let Some(roll) = roll_no {
            std::fs::write(dir.join("roll_no.txt"), roll).unwrap();
        }
    }

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, Vec<u8>),
    }

    fn multipart(uri: &str, parts: Vec<Part<'_>>) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    let header = format!("Content-Disposition: form-data; name=\"{name}\"");
                    body.extend_from_slice(format!("{header}\r\n\r\n{value}\r\n").as_bytes());
                }
                Part::File(name, bytes) => {
                    let header = format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"frame.png\""
                    );
                    body.extend_from_slice(
                        format!("{header}\r\nContent-Type: image/png\r\n\r\n").as_bytes(),
                    );
                    body.extend_from_slice(&bytes);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::post(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn reload() -> Request<Body> {
        Request::post("/reload_dataset").body(Body::empty()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn upload(uri: &str, image: Vec<u8>) -> Request<Body> {
        multipart(uri, vec![Part::File("image", image)])
    }

    #[tokio::test]
    async fn test_health_and_index() {
        let h = harness();
        let (status, body) = send_json(&h.app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));

        let (status, page) = send(&h.app, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(page).unwrap().contains("/recognize"));
    }

    #[tokio::test]
    async fn test_reload_empty_dataset_reports_zero() {
        let h = harness();
        let (status, body) = send_json(&h.app, reload()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["loaded"], 0);
        assert_eq!(body["names"], json!([]));
        assert_eq!(body["version"], 1);
    }

    #[tokio::test]
    async fn test_recognize_known_and_unknown() {
        let h = harness();
        add_person(&h.dataset_dir, "alice", Some("42"), 40);
        let (_, body) = send_json(&h.app, reload()).await;
        assert_eq!(body["names"], json!(["alice"]));

        let (status, body) = send_json(&h.app, upload("/recognize", png(40, 30))).await;
        assert_eq!(status, StatusCode::OK);
        let face = &body["faces"][0];
        assert_eq!(face["name"], "alice");
        assert_eq!(face["roll_no"], "42");
        assert_eq!(face["confidence"], 100.0);
        assert_eq!(face["box"], json!([0, 40, 30, 0]));

        let (_, body) = send_json(&h.app, upload("/recognize", png(60, 30))).await;
        let face = &body["faces"][0];
        assert_eq!(face["name"], "Unknown");
        assert_eq!(face["confidence"], 0.0);
        assert_eq!(face["roll_no"], Value::Null);
    }

    #[tokio::test]
    async fn test_recognize_without_faces_is_empty_list() {
        let h = harness();
        let (status, body) = send_json(&h.app, upload("/recognize", png(10, 10))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["faces"], json!([]));
    }

    #[tokio::test]
    async fn test_recognize_rejects_missing_or_bad_image() {
        let h = harness();
        let no_image = multipart("/recognize", vec![Part::Text("name", "x")]);
        let (status, body) = send_json(&h.app, no_image).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "no image");

        let garbage = upload("/recognize", b"not an image".to_vec());
        let (status, body) = send_json(&h.app, garbage).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad image");
    }

    #[tokio::test]
    async fn test_mark_twice_records_once_and_exports_agree() {
        let h = harness();
        add_person(&h.dataset_dir, "alice", Some("42"), 40);
        send_json(&h.app, reload()).await;

        let mark = || {
            multipart(
                "/mark",
                vec![
                    Part::Text("name", "alice"),
                    Part::Text("confidence", "91.5"),
                    Part::File("image", png(40, 30)),
                ],
            )
        };

        let (status, first) = send_json(&h.app, mark()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["marked"], true);
        assert_eq!(first["used_roll_no"], "42");
        let saved = PathBuf::from(first["path"].as_str().unwrap());
        assert!(saved.starts_with(h.faces_dir.join("alice")));
        assert!(saved.exists());

        let (_, second) = send_json(&h.app, mark()).await;
        assert_eq!(second["marked"], false);

        let (status, records) = send_json(&h.app, get("/attendance/json")).await;
        assert_eq!(status, StatusCode::OK);
        let records = records.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["roll_no"], 42);
        assert_eq!(records[0]["confidence"], 91.5);

        let resp = h.app.clone().oneshot(get("/attendance/csv")).await.unwrap();
        let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment; filename=\"attendance_"));
        let csv = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(String::from_utf8(csv.to_vec()).unwrap().lines().count() - 1, records.len());
    }

    #[tokio::test]
    async fn test_mark_with_explicit_roll_and_no_dataset() {
        let h = harness();
        let req = multipart(
            "/mark",
            vec![
                Part::Text("roll_no", "7"),
                Part::Text("name", "  bob / ../x "),
                Part::File("image", png(40, 30)),
            ],
        );
        let (status, body) = send_json(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["used_roll_no"], "7");
        let saved = PathBuf::from(body["path"].as_str().unwrap());
        assert!(saved.starts_with(h.faces_dir.join("bob  x")));
    }

    #[tokio::test]
    async fn test_mark_requires_name_and_image() {
        let h = harness();
        let no_image = multipart("/mark", vec![Part::Text("name", "alice")]);
        let (status, body) = send_json(&h.app, no_image).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "name and image required");

        let symbols_only = multipart(
            "/mark",
            vec![Part::Text("name", "../"), Part::File("image", png(40, 30))],
        );
        let (status, _) = send_json(&h.app, symbols_only).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, records) = send_json(&h.app, get("/attendance/json")).await;
        assert_eq!(records, json!([]));
    }

    #[tokio::test]
    async fn test_save_image_same_second_keeps_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("alice");

        let first = save_image(&dir, "20240304_091500", b"first").await.unwrap();
        let second = save_image(&dir, "20240304_091500", b"second").await.unwrap();
        let third = save_image(&dir, "20240304_091500", b"third").await.unwrap();

        assert_eq!(first, dir.join("20240304_091500.jpg"));
        assert_eq!(second, dir.join("20240304_091500_1.jpg"));
        assert_eq!(third, dir.join("20240304_091500_2.jpg"));
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name(" Ann-Marie O'Neil_2 "), "Ann-Marie ONeil_2");
        assert_eq!(sanitize_name("../../etc"), "etc");
        assert_eq!(sanitize_name("/."), "");
    }
}
