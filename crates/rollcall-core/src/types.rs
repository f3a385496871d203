use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which embedding backend produced a vector. Vectors from different
/// backends live in different spaces and are never compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SCRFD detection + ArcFace 512-d embedding.
    ArcFace,
    /// SeetaFace cascade detection + raw grayscale pixel embedding.
    Pixel,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::ArcFace => "arcface",
            BackendKind::Pixel => "pixel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arcface" => Some(BackendKind::ArcFace),
            "pixel" => Some(BackendKind::Pixel),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector output in the coordinate space of the image it ran on,
/// with optional five-point landmarks.
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

/// Axis-aligned face region in original (unscaled) frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceRegion {
    /// Map a box found on a frame resized by `scale` back to the original
    /// frame, rounding to whole pixels and clamping to the frame bounds.
    pub fn from_scaled(
        bbox: &BoundingBox,
        scale: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        let map =
            |v: f32, limit: u32| -> u32 { (v / scale).round().clamp(0.0, limit as f32) as u32 };
        Self {
            top: map(bbox.y, frame_height),
            right: map(bbox.x + bbox.width, frame_width),
            bottom: map(bbox.y + bbox.height, frame_height),
            left: map(bbox.x, frame_width),
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Face embedding vector tagged with the backend that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub backend: BackendKind,
}

impl Embedding {
    pub fn new(values: Vec<f32>, backend: BackendKind) -> Self {
        Self { values, backend }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Stable enrollment key (e.g. a student registration number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(pub String);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(s: &str) -> Self {
        IdentityKey(s.to_string())
    }
}

/// An enrolled person, referenced by value in the gallery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub key: IdentityKey,
    pub name: String,
}

impl Identity {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: IdentityKey(key.into()),
            name: name.into(),
        }
    }

    /// Name to show for this identity, falling back to the key.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.key.0
        } else {
            &self.name
        }
    }
}

/// One enrolled embedding for an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: Identity,
    pub embedding: Embedding,
}

/// A face found in one frame.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub region: FaceRegion,
    pub embedding: Embedding,
    /// Detector score, used to pick the best face during enrollment.
    pub score: f32,
}

/// Result of matching a live embedding against the gallery.
///
/// `identity == None` means "no entry within threshold", not "no face".
#[derive(Debug, Clone)]
pub struct RecognitionOutcome {
    pub identity: Option<Identity>,
    /// Normalized confidence in [0, 100], reported even on rejection.
    pub confidence: f32,
    /// Distance to the nearest entry; `None` when the gallery was empty.
    pub distance: Option<f32>,
}

impl RecognitionOutcome {
    pub fn unknown() -> Self {
        Self {
            identity: None,
            confidence: 0.0,
            distance: None,
        }
    }
}

/// Opaque id of the subject/class attendance is logged against.
pub type ContextId = i64;

/// The unit handed to the attendance store.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEvent {
    pub identity: Identity,
    pub context_id: ContextId,
    pub timestamp: DateTime<Utc>,
}

/// Per-detection pipeline decision shown to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionStatus {
    NewEvent,
    Duplicate,
    Unknown,
    CommitFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedDetection {
    pub region: FaceRegion,
    pub label: String,
    pub status: DetectionStatus,
    pub confidence: f32,
    /// Matched identity key, if any.
    pub identity: Option<IdentityKey>,
}
