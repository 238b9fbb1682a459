use rollcall_core::enhance::enhance_for_detection;
use rollcall_core::{load_dataset, AnalyzerError, DetectedFace, FaceAnalyzer, KnownFace};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Faces found in one submitted frame.
pub struct FrameAnalysis {
    pub width: u32,
    pub height: u32,
    pub faces: Vec<DetectedFace>,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Analyze {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<FrameAnalysis, EngineError>>,
    },
    LoadDataset {
        dir: PathBuf,
        reply: oneshot::Sender<Vec<KnownFace>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode, enhance and analyze an encoded image.
    pub async fn analyze(&self, image: Vec<u8>) -> Result<FrameAnalysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Scan the dataset directory and encode every sample photo.
    pub async fn load_dataset(&self, dir: PathBuf) -> Result<Vec<KnownFace>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::LoadDataset { dir, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The analyzer owns the inference sessions, which need exclusive access, so
/// every request is served in turn on this one thread.
pub fn spawn_engine(
    mut analyzer: Box<dyn FaceAnalyzer + Send>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { image, reply } => {
                        let _ = reply.send(run_analyze(analyzer.as_mut(), &image));
                    }
                    EngineRequest::LoadDataset { dir, reply } => {
                        let _ = reply.send(load_dataset(&dir, analyzer.as_mut()));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_analyze(
    analyzer: &mut dyn FaceAnalyzer,
    bytes: &[u8],
) -> Result<FrameAnalysis, EngineError> {
    let frame = image::load_from_memory(bytes)?.to_rgb8();
    let (width, height) = frame.dimensions();

    let enhanced = enhance_for_detection(&frame);
    let faces = analyzer.analyze(&enhanced)?;
    tracing::debug!(width, height, faces = faces.len(), "frame analyzed");

    Ok(FrameAnalysis { width, height, faces })
}
