//! Single-face capture for enrollment.

use crate::backend::{EmbeddingBackend, Purpose};
use crate::frame;
use crate::source::FrameSource;
use crate::types::DetectionResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face found after {attempts} frames")]
    NoFace { attempts: u32 },
    #[error("{count} faces in view, enrollment needs exactly one")]
    MultipleFaces { count: usize },
}

/// Read frames until exactly one face is seen and return it.
///
/// Frames with no face, failed reads and detector errors each use up one
/// attempt. A frame with several faces aborts immediately.
pub fn capture_enrollment(
    backend: &mut dyn EmbeddingBackend,
    source: &mut dyn FrameSource,
    attempts: u32,
) -> Result<DetectionResult, EnrollError> {
    for attempt in 1..=attempts {
        let mut frame = match source.read() {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(attempt, error = %e, "enrollment frame read failed");
                continue;
            }
        };
        frame::enhance(&mut frame.image);

        let mut faces = match backend.detect(&frame.image, Purpose::Enrollment) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(attempt, error = %e, "enrollment detection failed");
                continue;
            }
        };

        match faces.len() {
            0 => tracing::debug!(attempt, "no face in enrollment frame"),
            1 => {
                let face = faces.remove(0);
                tracing::info!(
                    attempt,
                    score = face.score,
                    width = face.region.width(),
                    height = face.region.height(),
                    "enrollment face captured"
                );
                return Ok(face);
            }
            count => return Err(EnrollError::MultipleFaces { count }),
        }
    }

    Err(EnrollError::NoFace { attempts })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::tests::{square_frame, BrightSquareLocator};
    use crate::backend::{DetectionScales, MatchPolicy, ScaledBackend};
    use crate::frame::Frame;
    use crate::pixel::PixelEncoder;
    use crate::source::SourceError;
    use crate::types::BackendKind;
    use image::RgbImage;
    use std::collections::VecDeque;

    /// Frame source replaying a fixed script; an exhausted script fails reads.
    pub(crate) struct ScriptedSource {
        pub(crate) frames: VecDeque<Result<RgbImage, SourceError>>,
        pub(crate) sequence: u64,
        pub(crate) released: bool,
    }

    impl ScriptedSource {
        pub(crate) fn new(frames: Vec<Result<RgbImage, SourceError>>) -> Self {
            Self { frames: frames.into(), sequence: 0, released: false }
        }
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Frame, SourceError> {
            if self.released {
                return Err(SourceError::Read("released".into()));
            }
            let image = self
                .frames
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Read("end of script".into())))?;
            self.sequence += 1;
            Ok(Frame::new(image, self.sequence))
        }

        fn release(&mut self) {
            self.released = true;
        }
    }

    fn backend() -> ScaledBackend<BrightSquareLocator, PixelEncoder> {
        ScaledBackend::new(
            BackendKind::Pixel,
            MatchPolicy { threshold: 4000.0, confidence_scale: 8000.0 },
            DetectionScales::default(),
            20,
            BrightSquareLocator,
            PixelEncoder::default(),
        )
    }

    fn blank() -> RgbImage {
        RgbImage::new(320, 240)
    }

    #[test]
    fn test_captures_first_single_face() {
        let mut source = ScriptedSource::new(vec![
            Err(SourceError::Read("timeout".into())),
            Ok(blank()),
            Ok(square_frame(320, 240, 100, 60, 80)),
        ]);
        let face = capture_enrollment(&mut backend(), &mut source, 5).unwrap();
        assert_eq!(face.embedding.backend, BackendKind::Pixel);
        assert!((face.region.left as i64 - 100).abs() <= 1);
        assert!((face.region.width() as i64 - 80).abs() <= 2);
    }

    #[test]
    fn test_gives_up_after_attempts() {
        let mut source =
            ScriptedSource::new(vec![Ok(blank()), Ok(blank()), Ok(blank()), Ok(blank())]);
        let err = capture_enrollment(&mut backend(), &mut source, 3).unwrap_err();
        assert!(matches!(err, EnrollError::NoFace { attempts: 3 }));
        // one frame left unread
        assert_eq!(source.frames.len(), 1);
    }

    #[test]
    fn test_multiple_faces_abort_immediately() {
        let mut backend = crate::pipeline::tests::FixedBackend::seeing(vec![vec![0.0], vec![1.0]]);
        let mut source = ScriptedSource::new(vec![Ok(blank()), Ok(blank())]);
        let err = capture_enrollment(&mut backend, &mut source, 5).unwrap_err();
        assert!(matches!(err, EnrollError::MultipleFaces { count: 2 }));
        assert_eq!(source.frames.len(), 1);
    }

    #[test]
    fn test_too_small_face_is_not_enrolled() {
        let mut source = ScriptedSource::new(vec![Ok(square_frame(320, 240, 10, 10, 8))]);
        let err = capture_enrollment(&mut backend(), &mut source, 1).unwrap_err();
        assert!(matches!(err, EnrollError::NoFace { .. }));
    }
}
