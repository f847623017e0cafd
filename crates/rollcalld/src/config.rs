use std::path::PathBuf;
use std::time::Duration;

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device index (`/dev/video{index}`).
    pub camera_index: usize,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Flat directory of `<admission_no>.<ext>` reference photos.
    pub enrollment_dir: PathBuf,
    /// Match threshold; `None` uses the provider's calibrated default.
    pub tolerance: Option<f32>,
    /// Upper bound on a single blocking frame read.
    pub read_timeout: Option<Duration>,
    /// Upper bound on a whole identification session.
    pub session_timeout: Option<Duration>,
    /// Number of warmup frames to discard after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Where preview frames are written; `None` disables the preview.
    pub preview_dir: Option<PathBuf>,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(rollcall_core::default_model_dir);

        let db_path = var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        let enrollment_dir = var("ROLLCALL_ENROLLMENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("enrollment"));

        let read_timeout_ms = parse_or(var("ROLLCALL_READ_TIMEOUT_MS"), 2000u64);
        let session_timeout_secs = parse_or(var("ROLLCALL_SESSION_TIMEOUT_SECS"), 0u64);

        Self {
            camera_index: parse_or(var("ROLLCALL_CAMERA_INDEX"), 0),
            model_dir,
            db_path,
            enrollment_dir,
            tolerance: var("ROLLCALL_TOLERANCE")
                .and_then(|v| v.parse::<f32>().ok())
                .filter(|t| t.is_finite() && *t > 0.0),
            read_timeout: (read_timeout_ms > 0).then(|| Duration::from_millis(read_timeout_ms)),
            session_timeout: (session_timeout_secs > 0)
                .then(|| Duration::from_secs(session_timeout_secs)),
            warmup_frames: parse_or(var("ROLLCALL_WARMUP_FRAMES"), 4),
            preview_dir: var("ROLLCALL_PREVIEW_DIR").filter(|v| !v.is_empty()).map(PathBuf::from),
            bus: match var("ROLLCALL_BUS").as_deref() {
                Some("system") => BusKind::System,
                _ => BusKind::Session,
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
