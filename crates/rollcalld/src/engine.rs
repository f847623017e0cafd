use crate::config::Config;
use crate::preview::{NullSink, PresentationSink, PreviewSink};
use crate::session::{IdentificationLoop, SessionError, SessionParams, SessionSummary};
use rollcall_core::{
    ArcFaceProvider, EmbeddingProvider, Gallery, GalleryError, GalleryReport, ProviderError,
};
use rollcall_hw::{Camera, CameraError, FrameSource};
use rollcall_store::{AttendanceStore, SessionIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// What the engine thread needs from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub camera_index: usize,
    pub enrollment_dir: PathBuf,
    pub tolerance: Option<f32>,
    pub read_timeout: Option<Duration>,
    pub session_timeout: Option<Duration>,
    pub warmup_frames: usize,
    pub preview_dir: Option<PathBuf>,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            camera_index: config.camera_index,
            enrollment_dir: config.enrollment_dir.clone(),
            tolerance: config.tolerance,
            read_timeout: config.read_timeout,
            session_timeout: config.session_timeout,
            warmup_frames: config.warmup_frames,
            preview_dir: config.preview_dir.clone(),
        }
    }
}

/// Fixed facts about the loaded provider, for status replies.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub provider_version: String,
    pub tolerance: f32,
    pub camera_index: usize,
    pub enrollment_dir: PathBuf,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Mark {
        identity: SessionIdentity,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<SessionSummary, EngineError>>,
    },
    Gallery {
        reply: oneshot::Sender<Result<GalleryReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    info: Arc<EngineInfo>,
}

impl EngineHandle {
    pub fn info(&self) -> &EngineInfo {
        &self.info
    }

    /// Run one identification session for `identity` until `cancel` fires,
    /// the operator stops it, or the camera fails.
    pub async fn mark(
        &self,
        identity: SessionIdentity,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Mark { identity, cancel, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Build the gallery from the enrollment directory and describe it.
    pub async fn gallery(&self) -> Result<GalleryReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Gallery { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine with the ArcFace provider and the configured V4L2 camera.
///
/// Loads both ONNX models up front and fails fast if either is missing. The
/// camera is opened per session, not here, so other software can use it
/// between check-ins.
pub fn spawn_engine(
    config: &Config,
    store: Arc<AttendanceStore>,
) -> Result<EngineHandle, EngineError> {
    let provider = ArcFaceProvider::load(&config.model_dir)?;
    tracing::info!(
        dir = %config.model_dir.display(),
        version = provider.version(),
        "face models loaded"
    );
    spawn_engine_with(provider, open_camera, store, EngineSettings::from(config))
}

/// Spawn the engine on a dedicated OS thread with any provider and source.
pub fn spawn_engine_with<P, S, F>(
    mut provider: P,
    mut open_source: F,
    store: Arc<AttendanceStore>,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError>
where
    P: EmbeddingProvider + Send + 'static,
    S: FrameSource,
    F: FnMut(&EngineSettings) -> Result<S, CameraError> + Send + 'static,
{
    let info = Arc::new(EngineInfo {
        provider_version: provider.version().to_string(),
        tolerance: settings.tolerance.unwrap_or_else(|| provider.default_tolerance()),
        camera_index: settings.camera_index,
        enrollment_dir: settings.enrollment_dir.clone(),
    });

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Mark { identity, cancel, reply } => {
                        let result = run_session(
                            &mut provider,
                            &mut open_source,
                            &store,
                            &settings,
                            identity,
                            cancel,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Gallery { reply } => {
                        let result = Gallery::build(&settings.enrollment_dir, &mut provider)
                            .map(|gallery| gallery.report())
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, info })
}

/// Open the V4L2 camera and let auto-exposure settle.
fn open_camera(settings: &EngineSettings) -> Result<Camera, CameraError> {
    let mut camera = Camera::open(settings.camera_index)?.with_read_timeout(settings.read_timeout);
    if settings.warmup_frames > 0 {
        tracing::debug!(count = settings.warmup_frames, "discarding warmup frames");
        if let Err(e) = camera.discard(settings.warmup_frames) {
            camera.release();
            return Err(e);
        }
    }
    Ok(camera)
}

fn preview_sink(settings: &EngineSettings) -> Box<dyn PresentationSink> {
    let Some(dir) = &settings.preview_dir else {
        return Box::new(NullSink);
    };
    match PreviewSink::new(dir) {
        Ok(sink) => Box::new(sink),
        Err(e) => {
            tracing::warn!(
                dir = %dir.display(),
                error = %e,
                "preview unavailable; continuing without it"
            );
            Box::new(NullSink)
        }
    }
}

/// Gallery, camera and loop for one check-in. The gallery is rebuilt every
/// session so newly enrolled photos are picked up without a restart.
fn run_session<P, S, F>(
    provider: &mut P,
    open_source: &mut F,
    store: &AttendanceStore,
    settings: &EngineSettings,
    identity: SessionIdentity,
    cancel: CancellationToken,
) -> Result<SessionSummary, EngineError>
where
    P: EmbeddingProvider,
    S: FrameSource,
    F: FnMut(&EngineSettings) -> Result<S, CameraError>,
{
    let span = tracing::info_span!(
        "session",
        run_id = %Uuid::new_v4(),
        admission_no = %identity.admission_no
    );
    let _entered = span.enter();

    let gallery = Gallery::build(&settings.enrollment_dir, provider)?;
    if gallery.is_empty() {
        tracing::warn!(
            dir = %settings.enrollment_dir.display(),
            "gallery is empty; nobody can be recognized"
        );
    }

    let tolerance = settings.tolerance.unwrap_or_else(|| provider.default_tolerance());
    let source = open_source(settings)?;
    let mut sink = preview_sink(settings);

    let params = SessionParams {
        identity,
        date: chrono::Local::now().date_naive(),
        tolerance,
        timeout: settings.session_timeout,
        cancel,
    };
    let summary =
        IdentificationLoop::new(source, provider, &gallery, store, &mut sink, params)?.run()?;

    tracing::info!(
        outcome = ?summary.outcome,
        recognized = summary.recognized,
        stop = ?summary.stop_reason,
        frames = summary.frames,
        "session finished"
    );
    Ok(summary)
}
