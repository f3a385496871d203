//! Pluggable detector + encoder backends.
//!
//! A backend turns a frame into zero or more (region, embedding) pairs and
//! owns the numeric policy (threshold, confidence transform) for its own
//! embedding space. Distance scales are not comparable across backends.

use crate::types::{BackendKind, BoundingBox, DetectionResult, Embedding, FaceRegion};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("embedding extraction failed: {0}")]
    Encoding(String),
    #[error("frame too small: {width}x{height}")]
    FrameTooSmall { width: u32, height: u32 },
}

/// Why a frame is being analysed; selects the resize scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Real-time recognition, favours throughput.
    Live,
    /// Enrollment capture, favours accuracy.
    Enrollment,
}

/// Per-purpose resize factors applied before detection.
#[derive(Debug, Clone, Copy)]
pub struct DetectionScales {
    pub live: f32,
    pub enrollment: f32,
}

impl DetectionScales {
    pub fn for_purpose(&self, purpose: Purpose) -> f32 {
        match purpose {
            Purpose::Live => self.live,
            Purpose::Enrollment => self.enrollment,
        }
    }
}

impl Default for DetectionScales {
    fn default() -> Self {
        Self {
            live: 0.5,
            enrollment: 1.0,
        }
    }
}

/// Accept threshold and distance→confidence transform of one backend.
///
/// `confidence = clamp(0, 100, (1 - distance / confidence_scale) * 100)`,
/// monotonically non-increasing in distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub threshold: f32,
    pub confidence_scale: f32,
}

impl MatchPolicy {
    pub fn accepts(&self, distance: f32) -> bool {
        distance <= self.threshold
    }

    pub fn confidence(&self, distance: f32) -> f32 {
        if self.confidence_scale <= 0.0 || !distance.is_finite() {
            return 0.0;
        }
        ((1.0 - distance / self.confidence_scale) * 100.0).clamp(0.0, 100.0)
    }
}

/// A detector + encoder pair.
pub trait EmbeddingBackend: Send {
    fn kind(&self) -> BackendKind;

    fn policy(&self) -> MatchPolicy;

    /// Find faces in `frame`. Regions are returned in original-frame
    /// coordinates regardless of the internal detection scale.
    fn detect(
        &mut self,
        frame: &RgbImage,
        purpose: Purpose,
    ) -> Result<Vec<DetectionResult>, BackendError>;
}

/// Finds face boxes on an (already resized) image.
pub trait FaceLocator: Send {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, BackendError>;
}

/// Turns one located face into an embedding vector.
pub trait FaceEncoder: Send {
    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, BackendError>;
}

/// Backend built from a locator and an encoder.
///
/// Resizes by the purpose's scale, locates and encodes at that resolution,
/// drops faces smaller than `min_face_px` (measured in original pixels)
/// and maps regions back to the original frame.
pub struct ScaledBackend<L, E> {
    kind: BackendKind,
    policy: MatchPolicy,
    scales: DetectionScales,
    min_face_px: u32,
    locator: L,
    encoder: E,
}

impl<L: FaceLocator, E: FaceEncoder> ScaledBackend<L, E> {
    pub fn new(
        kind: BackendKind,
        policy: MatchPolicy,
        scales: DetectionScales,
        min_face_px: u32,
        locator: L,
        encoder: E,
    ) -> Self {
        Self {
            kind,
            policy,
            scales,
            min_face_px,
            locator,
            encoder,
        }
    }
}

impl<L: FaceLocator, E: FaceEncoder> EmbeddingBackend for ScaledBackend<L, E> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn policy(&self) -> MatchPolicy {
        self.policy
    }

    fn detect(
        &mut self,
        frame: &RgbImage,
        purpose: Purpose,
    ) -> Result<Vec<DetectionResult>, BackendError> {
        let (width, height) = frame.dimensions();
        let scale = self.scales.for_purpose(purpose);
        let scaled = resize_for_detection(frame, scale)?;

        let faces = self.locator.locate(&scaled)?;
        let mut results = Vec::with_capacity(faces.len());

        for face in faces {
            let region = FaceRegion::from_scaled(&face, scale, width, height);
            if region.width() < self.min_face_px || region.height() < self.min_face_px {
                tracing::debug!(
                    width = region.width(),
                    height = region.height(),
                    min = self.min_face_px,
                    "dropping undersized face"
                );
                continue;
            }

            match self.encoder.encode(&scaled, &face) {
                Ok(values) => results.push(DetectionResult {
                    region,
                    embedding: Embedding::new(values, self.kind),
                    score: face.confidence,
                }),
                Err(e) => {
                    tracing::debug!(error = %e, ?region, "skipping face: encoding failed");
                }
            }
        }

        Ok(results)
    }
}

/// Resize `frame` by `scale` (bilinear). Scale 1.0 borrows the input.
pub fn resize_for_detection(
    frame: &RgbImage,
    scale: f32,
) -> Result<Cow<'_, RgbImage>, BackendError> {
    if (scale - 1.0).abs() < f32::EPSILON {
        return Ok(Cow::Borrowed(frame));
    }
    let (w, h) = frame.dimensions();
    let new_w = (w as f32 * scale).round() as u32;
    let new_h = (h as f32 * scale).round() as u32;
    if new_w == 0 || new_h == 0 {
        return Err(BackendError::FrameTooSmall { width: w, height: h });
    }
    Ok(Cow::Owned(imageops::resize(frame, new_w, new_h, FilterType::Triangle)))
}
