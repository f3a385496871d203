use anyhow::{bail, Context};
use rollcall_core::{BackendKind, DetectionScales, PipelineSettings};
use rollcall_hw::CaptureConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration.
///
/// Read from the TOML file named by `ROLLCALL_CONFIG` (if set), then
/// overridden field by field from `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device used when a client does not name one.
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frames discarded after stream start (camera AGC/AE stabilization).
    pub warmup_frames: u32,
    pub backend: BackendKind,
    /// Directory holding the ONNX and SeetaFace model files.
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    pub live_scale: f32,
    pub enrollment_scale: f32,
    pub min_face_px: u32,
    pub sample_every: u32,
    pub cooldown_secs: u64,
    pub commit_timeout_ms: u64,
    pub read_retry_ms: u64,
    pub stop_timeout_ms: u64,
    pub enroll_attempts: u32,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 1280,
            frame_height: 720,
            warmup_frames: 4,
            backend: BackendKind::ArcFace,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("attendance.db"),
            live_scale: 0.5,
            enrollment_scale: 1.0,
            min_face_px: 20,
            sample_every: 3,
            cooldown_secs: 300,
            commit_timeout_ms: 2000,
            read_retry_ms: 100,
            stop_timeout_ms: 2000,
            enroll_attempts: 10,
            bus: BusKind::Session,
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (optional) and the process environment,
    /// then validate.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, scale) in [
            ("live_scale", self.live_scale),
            ("enrollment_scale", self.enrollment_scale),
        ] {
            if !(scale.is_finite() && scale > 0.0 && scale <= 1.0) {
                bail!("{name} must be in (0, 1], got {scale}");
            }
        }
        if self.commit_timeout_ms == 0 {
            bail!("commit_timeout_ms must be greater than 0");
        }
        if self.enroll_attempts == 0 {
            bail!("enroll_attempts must be at least 1");
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            bail!(
                "frame size must be non-zero, got {}x{}",
                self.frame_width,
                self.frame_height
            );
        }
        self.cooldown()?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `ROLLCALL_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);

        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env.set("ROLLCALL_FRAME_WIDTH", &mut self.frame_width);
        env.set("ROLLCALL_FRAME_HEIGHT", &mut self.frame_height);
        env.set("ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        env.set("ROLLCALL_LIVE_SCALE", &mut self.live_scale);
        env.set("ROLLCALL_ENROLLMENT_SCALE", &mut self.enrollment_scale);
        env.set("ROLLCALL_MIN_FACE_PX", &mut self.min_face_px);
        env.set("ROLLCALL_SAMPLE_EVERY", &mut self.sample_every);
        env.set("ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs);
        env.set("ROLLCALL_COMMIT_TIMEOUT_MS", &mut self.commit_timeout_ms);
        env.set("ROLLCALL_READ_RETRY_MS", &mut self.read_retry_ms);
        env.set("ROLLCALL_STOP_TIMEOUT_MS", &mut self.stop_timeout_ms);
        env.set("ROLLCALL_ENROLL_ATTEMPTS", &mut self.enroll_attempts);

        if let Some(v) = lookup("ROLLCALL_BACKEND") {
            match BackendKind::parse(&v) {
                Some(kind) => self.backend = kind,
                None => tracing::warn!(value = %v, "ignoring unknown ROLLCALL_BACKEND"),
            }
        }
        if let Some(v) = lookup("ROLLCALL_BUS") {
            match v.as_str() {
                "session" => self.bus = BusKind::Session,
                "system" => self.bus = BusKind::System,
                other => tracing::warn!(value = other, "ignoring unknown ROLLCALL_BUS"),
            }
        }
    }

    pub fn cooldown(&self) -> anyhow::Result<chrono::TimeDelta> {
        i64::try_from(self.cooldown_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .with_context(|| format!("cooldown_secs {} is out of range", self.cooldown_secs))
    }

    pub fn pipeline_settings(&self) -> anyhow::Result<PipelineSettings> {
        Ok(PipelineSettings {
            sample_every: self.sample_every.max(1),
            cooldown: self.cooldown()?,
            commit_timeout: Duration::from_millis(self.commit_timeout_ms),
            read_retry: Duration::from_millis(self.read_retry_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            ..PipelineSettings::default()
        })
    }

    pub fn detection_scales(&self) -> DetectionScales {
        DetectionScales {
            live: self.live_scale,
            enrollment: self.enrollment_scale,
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            width: self.frame_width,
            height: self.frame_height,
            warmup_frames: self.warmup_frames,
        }
    }

    /// SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    /// SeetaFace frontal cascade used by the pixel backend.
    pub fn seeta_model_path(&self) -> PathBuf {
        self.model_dir.join("seeta_fd_frontal_v1.0.bin")
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn set<T: std::str::FromStr>(&self, key: &str, field: &mut T) {
        let Some(raw) = (self.0)(key) else {
            return;
        };
        match raw.trim().parse() {
            Ok(v) => *field = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }
}
