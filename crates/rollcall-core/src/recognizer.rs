//! ArcFace face encoder via ONNX Runtime, and the deep-embedding backend
//! built from SCRFD + ArcFace.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::backend::{BackendError, DetectionScales, FaceEncoder, MatchPolicy, ScaledBackend};
use crate::detector::ScrfdLocator;
use crate::types::{BackendKind, BoundingBox};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Unit-norm embeddings: distance 1.10 corresponds to cosine similarity ≈ 0.40.
pub const ARCFACE_POLICY: MatchPolicy = MatchPolicy {
    threshold: 1.10,
    confidence_scale: 2.0,
};

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks, alignment needs the detector's five points")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<RecognizerError> for BackendError {
    fn from(e: RecognizerError) -> Self {
        BackendError::Encoding(e.to_string())
    }
}

pub type ArcFaceBackend = ScaledBackend<ScrfdLocator, ArcFaceEncoder>;

/// Build the deep-embedding backend from the two ONNX model files.
pub fn load(
    detector_path: &Path,
    recognizer_path: &Path,
    scales: DetectionScales,
    min_face_px: u32,
) -> Result<ArcFaceBackend, BackendError> {
    let locator = ScrfdLocator::load(detector_path)?;
    let encoder = ArcFaceEncoder::load(recognizer_path)?;
    Ok(ScaledBackend::new(
        BackendKind::ArcFace,
        ARCFACE_POLICY,
        scales,
        min_face_px,
        locator,
        encoder,
    ))
}

pub struct ArcFaceEncoder {
    session: Session,
}

impl ArcFaceEncoder {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(l2_normalize(raw.to_vec()))
    }
}

impl FaceEncoder for ArcFaceEncoder {
    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, BackendError> {
        Ok(self.embed(image, face)?)
    }
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Aligned 112×112 RGB crop → normalized NCHW tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape_and_channels() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 127, 0]));
        let tensor = preprocess(&aligned);
        let size = ALIGNED_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, size, size]);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - (127.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_policy_matches_cosine_cutoff() {
        // For unit vectors d^2 = 2 - 2cos, so cos = 0.40 sits just under the threshold.
        let d = (2.0f32 - 2.0 * 0.40).sqrt();
        assert!(ARCFACE_POLICY.accepts(d));
        assert!(!ARCFACE_POLICY.accepts((2.0f32 - 2.0 * 0.35).sqrt()));
        assert!((ARCFACE_POLICY.confidence(0.0) - 100.0).abs() < 1e-6);
        assert_eq!(ARCFACE_POLICY.confidence(2.0), 0.0);
    }

    #[test]
    fn test_missing_model() {
        assert!(matches!(
            ArcFaceEncoder::load(Path::new("/nonexistent/w600k_r50.onnx")),
            Err(RecognizerError::ModelNotFound(_))
        ));
    }
}
