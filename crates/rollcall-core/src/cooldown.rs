//! Cooldown-based deduplication of attendance events, and the clock it reads.

use crate::types::IdentityKey;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Per-identity last-commit times for one session.
///
/// An identity is committable when it has never been committed or its last
/// commit is at least `period` old. State only advances through
/// [`Cooldown::record_commit`], which the caller invokes once the store
/// has settled the event (written, already present, or refused for good).
#[derive(Debug)]
pub struct Cooldown {
    period: Duration,
    last_commit: HashMap<IdentityKey, DateTime<Utc>>,
}

impl Cooldown {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_commit: HashMap::new(),
        }
    }

    pub fn should_commit(&self, identity: &IdentityKey, now: DateTime<Utc>) -> bool {
        match self.last_commit.get(identity) {
            None => true,
            Some(&last) => now - last >= self.period,
        }
    }

    pub fn record_commit(&mut self, identity: &IdentityKey, now: DateTime<Utc>) {
        self.last_commit.insert(identity.clone(), now);
    }

    /// Time left before `identity` can be committed again, if suppressed.
    pub fn remaining(&self, identity: &IdentityKey, now: DateTime<Utc>) -> Option<Duration> {
        let last = *self.last_commit.get(identity)?;
        let left = self.period - (now - last);
        (left > Duration::zero()).then_some(left)
    }
}
