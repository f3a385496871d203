//! Nearest-neighbour matching of a live embedding against the gallery.

use crate::backend::MatchPolicy;
use crate::types::{Embedding, GalleryEntry, RecognitionOutcome};

/// Distance between two embedding vectors of the same backend.
pub trait Metric {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl Metric for Euclidean {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
    }
}

/// Strategy for finding the best gallery match for a live embedding. An index-based
/// implementation can replace [`LinearMatcher`] without touching callers.
pub trait Matcher: Send {
    fn best_match(&self, query: &Embedding, gallery: &[GalleryEntry]) -> RecognitionOutcome;
}

/// Full linear scan; ties go to the earliest entry.
pub struct LinearMatcher<M = Euclidean> {
    policy: MatchPolicy,
    metric: M,
}

impl LinearMatcher<Euclidean> {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            policy,
            metric: Euclidean,
        }
    }
}

impl<M: Metric> LinearMatcher<M> {
    pub fn with_metric(policy: MatchPolicy, metric: M) -> Self {
        Self { policy, metric }
    }
}

impl<M: Metric + Send> Matcher for LinearMatcher<M> {
    fn best_match(&self, query: &Embedding, gallery: &[GalleryEntry]) -> RecognitionOutcome {
        let mut best: Option<(usize, f32)> = None;
        for (i, entry) in gallery.iter().enumerate() {
            let d = self.metric.distance(&query.values, &entry.embedding.values);
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        let Some((idx, distance)) = best else {
            return RecognitionOutcome::unknown();
        };

        let confidence = self.policy.confidence(distance);
        let identity = self
            .policy
            .accepts(distance)
            .then(|| gallery[idx].identity.clone());

        RecognitionOutcome {
            identity,
            confidence,
            distance: Some(distance),
        }
    }
}
