//! Per-frame recognition: enhance → detect → match → deduplicate → commit.

use crate::backend::{EmbeddingBackend, Purpose};
use crate::commit::{CommitOutcome, CommitWorker};
use crate::cooldown::{Clock, Cooldown};
use crate::frame::{self, Frame};
use crate::gallery::Gallery;
use crate::matcher::{LinearMatcher, Matcher};
use crate::types::{
    AnnotatedDetection, AttendanceEvent, ContextId, DetectionStatus, FaceRegion, IdentityKey,
    RecognitionOutcome,
};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Tunables for one recognition session.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Run detection on every Nth frame; the rest are only enhanced and forwarded.
    pub sample_every: u32,
    pub cooldown: chrono::Duration,
    pub commit_timeout: Duration,
    /// Pause after a failed frame read.
    pub read_retry: Duration,
    /// How long `stop` waits for the processing thread.
    pub stop_timeout: Duration,
    /// Depth of the report channel to the presentation side.
    pub report_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sample_every: 3,
            cooldown: chrono::Duration::seconds(300),
            commit_timeout: Duration::from_secs(2),
            read_retry: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            report_capacity: 8,
        }
    }
}

/// Immutable result batch for one frame.
#[derive(Clone, Serialize)]
pub struct FrameReport {
    pub session: Uuid,
    pub sequence: u64,
    pub sampled: bool,
    /// Clock reading the frame was decided at; also the timestamp of any
    /// attendance event committed for it.
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub frame: Arc<RgbImage>,
    pub detections: Vec<AnnotatedDetection>,
}

pub struct Pipeline {
    session: Uuid,
    context_id: ContextId,
    backend: Box<dyn EmbeddingBackend>,
    matcher: Box<dyn Matcher>,
    gallery: Arc<Gallery>,
    cooldown: Cooldown,
    committer: CommitWorker,
    clock: Arc<dyn Clock>,
    sample_every: u64,
    frames_seen: u64,
}

impl Pipeline {
    pub fn new(
        session: Uuid,
        context_id: ContextId,
        backend: Box<dyn EmbeddingBackend>,
        gallery: Arc<Gallery>,
        committer: CommitWorker,
        clock: Arc<dyn Clock>,
        settings: &PipelineSettings,
    ) -> Self {
        let matcher = Box::new(LinearMatcher::new(backend.policy()));
        Self {
            session,
            context_id,
            backend,
            matcher,
            gallery,
            cooldown: Cooldown::new(settings.cooldown),
            committer,
            clock,
            sample_every: settings.sample_every.max(1) as u64,
            frames_seen: 0,
        }
    }

    /// Give the backend back once the session is over.
    pub fn into_backend(self) -> Box<dyn EmbeddingBackend> {
        self.backend
    }

    /// Process one acquired frame. Every frame is enhanced and reported;
    /// only sampled frames run detection.
    pub fn handle_frame(&mut self, mut frame: Frame) -> FrameReport {
        frame::enhance(&mut frame.image);
        self.frames_seen += 1;
        let now = self.clock.now();

        let sampled = self.frames_seen % self.sample_every == 0;
        let detections = if sampled {
            self.recognize(&frame.image, now)
        } else {
            Vec::new()
        };

        FrameReport {
            session: self.session,
            sequence: frame.sequence,
            sampled,
            timestamp: now,
            frame: Arc::new(frame.image),
            detections,
        }
    }

    /// Detect, match and deduplicate every face in `image` as seen at `now`.
    fn recognize(&mut self, image: &RgbImage, now: DateTime<Utc>) -> Vec<AnnotatedDetection> {
        let results = match self.backend.detect(image, Purpose::Live) {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(
                    session = %self.session,
                    error = %e,
                    "detection failed; treating frame as empty"
                );
                return Vec::new();
            }
        };
        if results.is_empty() {
            return Vec::new();
        }

        let gallery = self.gallery.snapshot();
        // First decision per identity in this frame; later faces reuse it.
        let mut decided: HashMap<IdentityKey, DetectionStatus> = HashMap::new();

        results
            .into_iter()
            .map(|det| {
                let outcome = self.matcher.best_match(&det.embedding, &gallery);
                self.decide(det.region, outcome, now, &mut decided)
            })
            .collect()
    }

    fn decide(
        &mut self,
        region: FaceRegion,
        outcome: RecognitionOutcome,
        now: DateTime<Utc>,
        decided: &mut HashMap<IdentityKey, DetectionStatus>,
    ) -> AnnotatedDetection {
        let confidence = outcome.confidence;
        let Some(identity) = outcome.identity else {
            tracing::debug!(
                session = %self.session,
                confidence,
                distance = ?outcome.distance,
                "unknown face"
            );
            return AnnotatedDetection {
                region,
                label: "Unknown".to_string(),
                status: DetectionStatus::Unknown,
                confidence,
                identity: None,
            };
        };

        let status = match decided.get(&identity.key) {
            Some(DetectionStatus::NewEvent) => DetectionStatus::Duplicate,
            Some(&prev) => prev,
            None if self.cooldown.should_commit(&identity.key, now) => {
                let event = AttendanceEvent {
                    identity: identity.clone(),
                    context_id: self.context_id,
                    timestamp: now,
                };
                let outcome = self.committer.commit(event);
                if outcome.advances_cooldown() {
                    self.cooldown.record_commit(&identity.key, now);
                }
                self.log_commit(&identity.key, confidence, &outcome);
                match outcome {
                    CommitOutcome::Committed => DetectionStatus::NewEvent,
                    CommitOutcome::AlreadyLogged => DetectionStatus::Duplicate,
                    CommitOutcome::Rejected(_)
                    | CommitOutcome::Failed(_)
                    | CommitOutcome::TimedOut => DetectionStatus::CommitFailed,
                }
            }
            None => {
                tracing::debug!(
                    session = %self.session,
                    identity = %identity.key,
                    remaining_secs = ?self
                        .cooldown
                        .remaining(&identity.key, now)
                        .map(|d| d.num_seconds()),
                    "already marked"
                );
                DetectionStatus::Duplicate
            }
        };
        decided.insert(identity.key.clone(), status);

        let name = identity.display_name();
        let label = match status {
            DetectionStatus::NewEvent => name.to_string(),
            DetectionStatus::Duplicate => format!("{name} (already marked)"),
            DetectionStatus::CommitFailed => format!("{name} (not saved)"),
            DetectionStatus::Unknown => "Unknown".to_string(),
        };

        AnnotatedDetection {
            region,
            label,
            status,
            confidence,
            identity: Some(identity.key),
        }
    }

    fn log_commit(&self, key: &IdentityKey, confidence: f32, outcome: &CommitOutcome) {
        let session = self.session;
        match outcome {
            CommitOutcome::Committed => {
                tracing::info!(
                    session = %session,
                    identity = %key,
                    context = self.context_id,
                    confidence,
                    "attendance logged"
                );
            }
            CommitOutcome::AlreadyLogged => {
                tracing::info!(session = %session, identity = %key, "store already had this event");
            }
            CommitOutcome::Rejected(reason) => {
                tracing::warn!(
                    session = %session,
                    identity = %key,
                    reason = %reason,
                    "attendance rejected by store; not retrying this window"
                );
            }
            CommitOutcome::Failed(reason) => {
                tracing::warn!(
                    session = %session,
                    identity = %key,
                    reason = %reason,
                    "attendance commit failed; will retry"
                );
            }
            CommitOutcome::TimedOut => {
                tracing::warn!(
                    session = %session,
                    identity = %key,
                    "attendance commit timed out; will retry"
                );
            }
        }
    }
}
