//! Attendance commits with a bounded wait.
//!
//! Store writes run on a dedicated worker thread so a hanging store cannot
//! stall the processing loop for longer than the commit timeout. A write
//! that outlives its timeout still completes on the worker; the retry that
//! follows is absorbed by the store's own duplicate detection.

use crate::store::{AttendanceStore, CommitError};
use crate::types::AttendanceEvent;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

const COMMIT_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Store reported the event as already present.
    AlreadyLogged,
    /// Store refused the event for good; not retried.
    Rejected(String),
    Failed(String),
    TimedOut,
}

impl CommitOutcome {
    /// Whether the deduplicator should advance for this identity.
    pub fn advances_cooldown(&self) -> bool {
        matches!(
            self,
            CommitOutcome::Committed | CommitOutcome::AlreadyLogged | CommitOutcome::Rejected(_)
        )
    }
}

struct CommitRequest {
    event: AttendanceEvent,
    reply: SyncSender<Result<(), CommitError>>,
}

/// Handle to a commit worker thread. Dropping it lets the worker drain
/// its queue and exit.
pub struct CommitWorker {
    tx: SyncSender<CommitRequest>,
    timeout: Duration,
}

impl CommitWorker {
    pub fn spawn(store: Arc<dyn AttendanceStore>, timeout: Duration) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<CommitRequest>(COMMIT_QUEUE_DEPTH);

        std::thread::Builder::new()
            .name("rollcall-commit".into())
            .spawn(move || {
                tracing::debug!("commit worker started");
                for req in rx {
                    let result = store.commit_attendance(&req.event);
                    // Receiver may have timed out and gone away.
                    let _ = req.reply.send(result);
                }
                tracing::debug!("commit worker exiting");
            })?;

        Ok(Self { tx, timeout })
    }

    /// Submit `event` and wait at most the configured timeout.
    pub fn commit(&self, event: AttendanceEvent) -> CommitOutcome {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let req = CommitRequest {
            event,
            reply: reply_tx,
        };

        match self.tx.try_send(req) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return CommitOutcome::Failed("commit queue full".into());
            }
            Err(TrySendError::Disconnected(_)) => {
                return CommitOutcome::Failed("commit worker exited".into());
            }
        }

        match reply_rx.recv_timeout(self.timeout) {
            Ok(Ok(())) => CommitOutcome::Committed,
            Ok(Err(CommitError::AlreadyLogged)) => CommitOutcome::AlreadyLogged,
            Ok(Err(CommitError::Rejected(reason))) => CommitOutcome::Rejected(reason),
            Ok(Err(CommitError::Transient(reason))) => CommitOutcome::Failed(reason),
            Err(RecvTimeoutError::Timeout) => CommitOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                CommitOutcome::Failed("commit worker dropped request".into())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::types::{BackendKind, GalleryEntry, Identity};
    use std::sync::Mutex;
    use std::time::Instant;

    /// In-memory store whose commit behaviour is scripted per call.
    pub(crate) struct ScriptedStore {
        pub(crate) gallery: Vec<GalleryEntry>,
        pub(crate) commits: Mutex<Vec<AttendanceEvent>>,
        pub(crate) script: Mutex<Vec<Result<(), CommitError>>>,
        pub(crate) delay: Duration,
    }

    impl ScriptedStore {
        pub(crate) fn new(gallery: Vec<GalleryEntry>) -> Self {
            Self {
                gallery,
                commits: Mutex::new(Vec::new()),
                script: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        /// Queue results for the next commits; once exhausted, commits succeed.
        pub(crate) fn then(self, results: Vec<Result<(), CommitError>>) -> Self {
            *self.script.lock().unwrap() = results.into_iter().rev().collect();
            self
        }

        pub(crate) fn committed(&self) -> usize {
            self.commits.lock().unwrap().len()
        }
    }

    impl AttendanceStore for ScriptedStore {
        fn load_gallery(&self, backend: BackendKind) -> Result<Vec<GalleryEntry>, StoreError> {
            Ok(self
                .gallery
                .iter()
                .filter(|e| e.embedding.backend == backend)
                .cloned()
                .collect())
        }

        fn commit_attendance(&self, event: &AttendanceEvent) -> Result<(), CommitError> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let scripted = self.script.lock().unwrap().pop().unwrap_or(Ok(()));
            if scripted.is_ok() {
                self.commits.lock().unwrap().push(event.clone());
            }
            scripted
        }
    }

    fn event() -> AttendanceEvent {
        AttendanceEvent {
            identity: Identity::new("A", "Alice"),
            context_id: 1,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_outcomes_follow_store_results() {
        let store = Arc::new(ScriptedStore::new(vec![]).then(vec![
            Ok(()),
            Err(CommitError::AlreadyLogged),
            Err(CommitError::Transient("disk full".into())),
            Err(CommitError::Rejected("no such identity".into())),
        ]));
        let worker = CommitWorker::spawn(store.clone(), Duration::from_secs(5)).unwrap();

        assert_eq!(worker.commit(event()), CommitOutcome::Committed);
        assert_eq!(worker.commit(event()), CommitOutcome::AlreadyLogged);
        assert_eq!(worker.commit(event()), CommitOutcome::Failed("disk full".into()));
        assert_eq!(
            worker.commit(event()),
            CommitOutcome::Rejected("no such identity".into())
        );
        assert_eq!(store.committed(), 1);
    }

    #[test]
    fn test_slow_store_times_out_quickly() {
        let mut store = ScriptedStore::new(vec![]);
        store.delay = Duration::from_millis(500);
        let worker = CommitWorker::spawn(Arc::new(store), Duration::from_millis(50)).unwrap();

        let started = Instant::now();
        let outcome = worker.commit(event());
        assert_eq!(outcome, CommitOutcome::TimedOut);
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "waited {:?}",
            started.elapsed()
        );
        assert!(!outcome.advances_cooldown());
    }

    #[test]
    fn test_advances_cooldown() {
        assert!(CommitOutcome::Committed.advances_cooldown());
        assert!(CommitOutcome::AlreadyLogged.advances_cooldown());
        assert!(CommitOutcome::Rejected("x".into()).advances_cooldown());
        assert!(!CommitOutcome::Failed("x".into()).advances_cooldown());
        assert!(!CommitOutcome::TimedOut.advances_cooldown());
    }
}
