//! Cascade detector + raw-pixel embedding backend.
//!
//! Lightweight fallback when no ONNX models are available: faces are found
//! with the SeetaFace cascade (`rustface`) and embedded as a 64×64
//! grayscale crop. Distances are raw pixel-intensity L2 norms, so the
//! threshold and confidence scale live in the thousands.

use crate::backend::{
    BackendError, DetectionScales, FaceEncoder, FaceLocator, MatchPolicy, ScaledBackend,
};
use crate::types::{BackendKind, BoundingBox};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const PIXEL_CROP_SIZE: u32 = 64;
const PIXEL_THRESHOLD: f32 = 4000.0;
const PIXEL_CONFIDENCE_SCALE: f32 = 8000.0;

const SEETA_MIN_FACE_SIZE: u32 = 20;
const SEETA_SCORE_THRESHOLD: f64 = 2.0;
const SEETA_PYRAMID_SCALE: f32 = 0.8;
const SEETA_WINDOW_STEP: u32 = 4;

pub const PIXEL_POLICY: MatchPolicy = MatchPolicy {
    threshold: PIXEL_THRESHOLD,
    confidence_scale: PIXEL_CONFIDENCE_SCALE,
};

pub type PixelBackend = ScaledBackend<SeetaLocator, PixelEncoder>;

/// Build the pixel backend from a SeetaFace model file.
pub fn load(
    model_path: &Path,
    scales: DetectionScales,
    min_face_px: u32,
) -> Result<PixelBackend, BackendError> {
    let locator = SeetaLocator::load(model_path)?;
    Ok(ScaledBackend::new(
        BackendKind::Pixel,
        PIXEL_POLICY,
        scales,
        min_face_px,
        locator,
        PixelEncoder::default(),
    ))
}

/// SeetaFace frontal cascade via `rustface`.
pub struct SeetaLocator {
    model: rustface::Model,
}

impl SeetaLocator {
    pub fn load(model_path: &Path) -> Result<Self, BackendError> {
        let file = File::open(model_path).map_err(|e| {
            BackendError::Detection(format!(
                "cannot open SeetaFace model {}: {e}",
                model_path.display()
            ))
        })?;
        let model = rustface::read_model(BufReader::new(file))
            .map_err(|e| BackendError::Detection(format!("bad SeetaFace model: {e}")))?;
        tracing::info!(path = %model_path.display(), "loaded SeetaFace model");
        Ok(Self { model })
    }
}

impl FaceLocator for SeetaLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, BackendError> {
        let gray = imageops::grayscale(image);
        let (width, height) = gray.dimensions();

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(SEETA_MIN_FACE_SIZE);
        detector.set_score_thresh(SEETA_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(SEETA_PYRAMID_SCALE);
        detector.set_slide_window_step(SEETA_WINDOW_STEP, SEETA_WINDOW_STEP);

        let faces = detector.detect(&rustface::ImageData::new(gray.as_raw(), width, height));

        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                BoundingBox {
                    x: bbox.x() as f32,
                    y: bbox.y() as f32,
                    width: bbox.width() as f32,
                    height: bbox.height() as f32,
                    confidence: face.score() as f32,
                    landmarks: None,
                }
            })
            .collect())
    }
}

/// Embeds a face as the raw intensities of a fixed-size grayscale crop.
pub struct PixelEncoder {
    crop_size: u32,
}

impl Default for PixelEncoder {
    fn default() -> Self {
        Self {
            crop_size: PIXEL_CROP_SIZE,
        }
    }
}

impl FaceEncoder for PixelEncoder {
    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, BackendError> {
        let (w, h) = image.dimensions();
        let x0 = face.x.max(0.0).floor() as u32;
        let y0 = face.y.max(0.0).floor() as u32;
        let x1 = ((face.x + face.width).ceil().max(0.0) as u32).min(w);
        let y1 = ((face.y + face.height).ceil().max(0.0) as u32).min(h);

        if x1 <= x0 || y1 <= y0 {
            return Err(BackendError::Encoding(format!(
                "face box outside image: ({}, {}) {}x{}",
                face.x, face.y, face.width, face.height
            )));
        }

        let crop = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
        let gray = imageops::grayscale(&crop);
        let resized = imageops::resize(&gray, self.crop_size, self.crop_size, FilterType::Triangle);

        Ok(resized.as_raw().iter().map(|&p| p as f32).collect())
    }
}
