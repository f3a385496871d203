//! Session lifecycle: one processing thread per running session.
//!
//! The controller owns the backend while idle. `start` loads the gallery,
//! opens the camera and moves the backend into a dedicated thread together
//! with a fresh cooldown state and commit worker; the thread hands the
//! backend back when it exits. `stop` raises a flag polled once per frame
//! and waits a bounded time for the thread to finish.

use crate::backend::EmbeddingBackend;
use crate::commit::CommitWorker;
use crate::cooldown::Clock;
use crate::enroll::{self, EnrollError};
use crate::gallery::{Gallery, GalleryError};
use crate::pipeline::{FrameReport, Pipeline, PipelineSettings};
use crate::source::{FrameSource, FrameSourceOpener, SourceError};
use crate::store::{AttendanceStore, StoreError};
use crate::types::{BackendKind, ContextId, DetectionResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Log every Nth consecutive read failure after the first.
const READ_FAILURE_LOG_EVERY: u32 = 50;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("gallery is empty for backend {0}; enroll someone first")]
    EmptyGallery(BackendKind),
    #[error("backend is still held by a session that has not exited")]
    BackendBusy,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Handle returned by a successful [`SessionController::start`].
pub struct StartedSession {
    pub id: Uuid,
    /// Per-frame results. Reports are dropped when this falls behind.
    pub reports: mpsc::Receiver<FrameReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub session: Option<Uuid>,
    pub camera: Option<String>,
    pub context_id: Option<ContextId>,
    pub started_at: Option<DateTime<Utc>>,
    pub backend: BackendKind,
    pub backend_available: bool,
    pub gallery_size: usize,
}

/// Processing thread; yields the backend on exit, or `None` if the thread
/// never received its work.
type BackendHandle = JoinHandle<Option<Box<dyn EmbeddingBackend>>>;

struct Running {
    id: Uuid,
    camera: String,
    context_id: ContextId,
    started_at: DateTime<Utc>,
    stop: Arc<AtomicBool>,
    done: oneshot::Receiver<()>,
    handle: BackendHandle,
}

/// Everything the processing thread takes ownership of.
struct SessionWork {
    pipeline: Pipeline,
    source: Box<dyn FrameSource>,
}

pub struct SessionController {
    kind: BackendKind,
    backend: Option<Box<dyn EmbeddingBackend>>,
    gallery: Arc<Gallery>,
    store: Arc<dyn AttendanceStore>,
    opener: Arc<dyn FrameSourceOpener>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    thread_builder: fn() -> std::thread::Builder,
    running: Option<Running>,
    /// Thread that outlived its stop timeout; still owns the backend.
    lingering: Option<BackendHandle>,
}

fn pipeline_thread() -> std::thread::Builder {
    std::thread::Builder::new().name("rollcall-pipeline".into())
}

impl SessionController {
    pub fn new(
        backend: Box<dyn EmbeddingBackend>,
        store: Arc<dyn AttendanceStore>,
        opener: Arc<dyn FrameSourceOpener>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            kind: backend.kind(),
            backend: Some(backend),
            gallery: Arc::new(Gallery::new()),
            store,
            opener,
            clock,
            settings,
            thread_builder: pipeline_thread,
            running: None,
            lingering: None,
        }
    }

    /// Replace the gallery from the store. Only allowed while idle.
    fn reload_gallery(&mut self) -> Result<usize, SessionError> {
        if self.running.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        let entries = self.store.load_gallery(self.kind)?;
        let count = self.gallery.replace(self.kind, entries)?;
        tracing::info!(backend = %self.kind, entries = count, "gallery loaded");
        Ok(count)
    }

    /// Begin recognizing on `camera`, logging attendance against `context_id`.
    ///
    /// Refused when a session is running, the gallery is empty or the
    /// camera cannot be opened. Nothing is left half-started on refusal.
    pub fn start(
        &mut self,
        camera: &str,
        context_id: ContextId,
    ) -> Result<StartedSession, SessionError> {
        if self.running.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        self.reclaim_backend();
        if self.backend.is_none() {
            return Err(SessionError::BackendBusy);
        }

        if self.reload_gallery()? == 0 {
            return Err(SessionError::EmptyGallery(self.kind));
        }

        let mut source = self.opener.open(camera)?;
        let committer =
            match CommitWorker::spawn(Arc::clone(&self.store), self.settings.commit_timeout) {
                Ok(worker) => worker,
                Err(e) => {
                    source.release();
                    return Err(e.into());
                }
            };

        let Some(backend) = self.backend.take() else {
            source.release();
            return Err(SessionError::BackendBusy);
        };

        let id = Uuid::new_v4();
        let pipeline = Pipeline::new(
            id,
            context_id,
            backend,
            Arc::clone(&self.gallery),
            committer,
            Arc::clone(&self.clock),
            &self.settings,
        );

        let stop = Arc::new(AtomicBool::new(false));
        let (report_tx, report_rx) = mpsc::channel(self.settings.report_capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        let read_retry = self.settings.read_retry;
        let thread_stop = Arc::clone(&stop);

        // The thread is created first and only then handed its work, so a
        // failed spawn leaves the backend and the camera with us.
        let (work_tx, work_rx) = std::sync::mpsc::sync_channel::<SessionWork>(1);
        let spawned = (self.thread_builder)().spawn(move || {
            let work = work_rx.recv().ok()?;
            let backend = run_session(work, &thread_stop, &report_tx, read_retry);
            let _ = done_tx.send(());
            Some(backend)
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                source.release();
                self.backend = Some(pipeline.into_backend());
                tracing::error!(session = %id, error = %e, "cannot spawn processing thread");
                return Err(e.into());
            }
        };
        if let Err(returned) = hand_over(&work_tx, SessionWork { pipeline, source }) {
            let SessionWork { pipeline, mut source } = returned;
            source.release();
            self.backend = Some(pipeline.into_backend());
            return Err(std::io::Error::other("processing thread exited before starting").into());
        }

        tracing::info!(
            session = %id,
            camera,
            context = context_id,
            backend = %self.kind,
            "session started"
        );

        self.running = Some(Running {
            id,
            camera: camera.to_string(),
            context_id,
            started_at: self.clock.now(),
            stop,
            done: done_rx,
            handle,
        });

        Ok(StartedSession {
            id,
            reports: report_rx,
        })
    }

    /// Stop the running session. Returns `false` when nothing was running.
    ///
    /// Waits up to the configured stop timeout. A thread that is still busy
    /// after that keeps the backend until it exits on its own.
    pub async fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            self.reclaim_backend();
            return false;
        };

        running.stop.store(true, Ordering::Release);

        match tokio::time::timeout(self.settings.stop_timeout, running.done).await {
            Ok(_) => {
                self.join_backend(running.handle);
                tracing::info!(session = %running.id, "session stopped");
            }
            Err(_) => {
                tracing::warn!(
                    session = %running.id,
                    timeout_ms = self.settings.stop_timeout.as_millis() as u64,
                    "processing thread did not exit in time; backend will be reclaimed later"
                );
                self.lingering = Some(running.handle);
            }
        }
        true
    }

    pub fn status(&mut self) -> SessionStatus {
        self.reclaim_backend();
        let running = self.running.as_ref();
        SessionStatus {
            running: running.is_some(),
            session: running.map(|r| r.id),
            camera: running.map(|r| r.camera.clone()),
            context_id: running.map(|r| r.context_id),
            started_at: running.map(|r| r.started_at),
            backend: self.kind,
            backend_available: self.backend.is_some(),
            gallery_size: self.gallery.len(),
        }
    }

    /// Capture one face from `camera` for enrollment. Only allowed while idle.
    pub fn enroll(
        &mut self,
        camera: &str,
        attempts: u32,
    ) -> Result<DetectionResult, SessionError> {
        if self.running.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        self.reclaim_backend();
        let backend = self.backend.as_mut().ok_or(SessionError::BackendBusy)?;

        let mut source = self.opener.open(camera)?;
        let captured = enroll::capture_enrollment(backend.as_mut(), source.as_mut(), attempts);
        source.release();
        Ok(captured?)
    }

    fn reclaim_backend(&mut self) {
        if self.lingering.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = self.lingering.take() {
                self.join_backend(handle);
                tracing::info!("backend reclaimed from late-exiting session");
            }
        }
    }

    fn join_backend(&mut self, handle: BackendHandle) {
        match handle.join() {
            Ok(Some(backend)) => self.backend = Some(backend),
            Ok(None) => tracing::error!(backend = %self.kind, "processing thread never started"),
            Err(_) => {
                tracing::error!(backend = %self.kind, "processing thread panicked; backend lost")
            }
        }
    }
}

/// Send `work` to a freshly spawned processing thread, getting it back if
/// the thread is already gone.
fn hand_over(tx: &SyncSender<SessionWork>, work: SessionWork) -> Result<(), SessionWork> {
    tx.send(work).map_err(|e| e.0)
}

/// Processing loop. Runs until `stop` is raised, then releases the source
/// and returns the backend.
fn run_session(
    work: SessionWork,
    stop: &AtomicBool,
    reports: &mpsc::Sender<FrameReport>,
    read_retry: Duration,
) -> Box<dyn EmbeddingBackend> {
    let SessionWork {
        mut pipeline,
        mut source,
    } = work;
    let mut read_failures: u32 = 0;
    let mut dropped: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        let frame = match source.read() {
            Ok(frame) => {
                if read_failures > 0 {
                    tracing::debug!(failures = read_failures, "frame source recovered");
                }
                read_failures = 0;
                frame
            }
            Err(e) => {
                read_failures += 1;
                if read_failures == 1 || read_failures % READ_FAILURE_LOG_EVERY == 0 {
                    tracing::warn!(
                        error = %e,
                        consecutive = read_failures,
                        "frame read failed; retrying"
                    );
                }
                std::thread::sleep(read_retry);
                continue;
            }
        };

        let report = pipeline.handle_frame(frame);
        if let Err(mpsc::error::TrySendError::Full(_)) = reports.try_send(report) {
            dropped += 1;
            tracing::trace!(dropped, "report channel full; frame not forwarded");
        }
    }

    source.release();
    tracing::debug!(dropped_reports = dropped, "processing loop exited");
    pipeline.into_backend()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MatchPolicy, Purpose};
    use crate::commit::tests::ScriptedStore;
    use crate::cooldown::SystemClock;
    use crate::frame::Frame;
    use crate::pipeline::tests::{alice, FixedBackend};
    use crate::types::DetectionStatus;
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;

    /// Endless source of blank frames, tracking opens and releases.
    #[derive(Default)]
    struct LoopOpener {
        fail: bool,
        opened: AtomicUsize,
        released: Arc<AtomicUsize>,
    }

    struct LoopSource {
        sequence: u64,
        released: Arc<AtomicUsize>,
    }

    impl FrameSource for LoopSource {
        fn read(&mut self) -> Result<Frame, SourceError> {
            std::thread::sleep(Duration::from_millis(2));
            self.sequence += 1;
            Ok(Frame::new(RgbImage::new(64, 48), self.sequence))
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FrameSourceOpener for LoopOpener {
        fn open(&self, selector: &str) -> Result<Box<dyn FrameSource>, SourceError> {
            if self.fail {
                return Err(SourceError::Open {
                    selector: selector.into(),
                    reason: "no such device".into(),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(LoopSource {
                sequence: 0,
                released: Arc::clone(&self.released),
            }))
        }
    }

    /// Backend whose every detection takes `delay`.
    struct SlowBackend {
        inner: FixedBackend,
        delay: Duration,
    }

    impl EmbeddingBackend for SlowBackend {
        fn kind(&self) -> BackendKind {
            self.inner.kind()
        }

        fn policy(&self) -> MatchPolicy {
            self.inner.policy()
        }

        fn detect(
            &mut self,
            frame: &RgbImage,
            purpose: Purpose,
        ) -> Result<Vec<DetectionResult>, BackendError> {
            std::thread::sleep(self.delay);
            self.inner.detect(frame, purpose)
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            sample_every: 1,
            commit_timeout: Duration::from_millis(500),
            read_retry: Duration::from_millis(5),
            stop_timeout: Duration::from_secs(2),
            ..PipelineSettings::default()
        }
    }

    fn controller(
        backend: Box<dyn EmbeddingBackend>,
        store: Arc<ScriptedStore>,
        opener: Arc<LoopOpener>,
        settings: PipelineSettings,
    ) -> SessionController {
        SessionController::new(backend, store, opener, Arc::new(SystemClock), settings)
    }

    fn blind() -> Box<dyn EmbeddingBackend> {
        Box::new(FixedBackend::seeing(vec![]))
    }

    async fn next_sampled(reports: &mut mpsc::Receiver<FrameReport>) -> FrameReport {
        loop {
            let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
                .await
                .expect("no report in time")
                .expect("report channel closed");
            if report.sampled {
                return report;
            }
        }
    }

    #[tokio::test]
    async fn test_start_refuses_empty_gallery() {
        let store = Arc::new(ScriptedStore::new(vec![]));
        let opener = Arc::new(LoopOpener::default());
        let mut ctl = controller(blind(), store, opener.clone(), settings());

        let err = ctl.start("/dev/video0", 1).err().unwrap();
        assert!(matches!(err, SessionError::EmptyGallery(BackendKind::ArcFace)));
        assert_eq!(opener.opened.load(Ordering::SeqCst), 0);
        assert!(!ctl.status().running);
    }

    #[tokio::test]
    async fn test_start_refuses_unopenable_camera() {
        let store = Arc::new(ScriptedStore::new(vec![alice()]));
        let opener = Arc::new(LoopOpener {
            fail: true,
            ..LoopOpener::default()
        });
        let mut ctl = controller(blind(), store, opener, settings());

        let err = ctl.start("/dev/video9", 1).err().unwrap();
        assert!(matches!(err, SessionError::Source(SourceError::Open { .. })));
        let status = ctl.status();
        assert!(!status.running);
        assert!(status.backend_available);
    }

    #[tokio::test]
    async fn test_failed_thread_spawn_keeps_backend_and_releases_camera() {
        let store = Arc::new(ScriptedStore::new(vec![alice()]));
        let opener = Arc::new(LoopOpener::default());
        let mut ctl = controller(blind(), store, opener.clone(), settings());
        // A stack larger than the address space cannot be mapped.
        ctl.thread_builder = || std::thread::Builder::new().stack_size(1 << 50);

        let err = ctl.start("/dev/video0", 1).err().unwrap();
        assert!(matches!(err, SessionError::Spawn(_)));
        assert_eq!(opener.opened.load(Ordering::SeqCst), 1);
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);
        let status = ctl.status();
        assert!(!status.running);
        assert!(status.backend_available);

        ctl.thread_builder = pipeline_thread;
        assert!(ctl.start("/dev/video0", 1).is_ok());
        assert!(ctl.stop().await);
    }

    #[tokio::test]
    async fn test_session_commits_and_stops_cleanly() {
        let store = Arc::new(ScriptedStore::new(vec![alice()]));
        let opener = Arc::new(LoopOpener::default());
        let backend = FixedBackend::seeing(vec![vec![0.05, 0.0]]);
        let mut ctl = controller(Box::new(backend), store.clone(), opener.clone(), settings());

        let mut started = ctl.start("/dev/video0", 3).unwrap();
        assert!(matches!(
            ctl.start("/dev/video0", 3),
            Err(SessionError::AlreadyRunning)
        ));
        assert!(matches!(ctl.reload_gallery(), Err(SessionError::AlreadyRunning)));

        let first = next_sampled(&mut started.reports).await;
        assert_eq!(first.session, started.id);
        assert_eq!(first.detections[0].status, DetectionStatus::NewEvent);
        let second = next_sampled(&mut started.reports).await;
        assert_eq!(second.detections[0].status, DetectionStatus::Duplicate);

        let status = ctl.status();
        assert!(status.running);
        assert_eq!(status.context_id, Some(3));
        assert_eq!(status.gallery_size, 1);

        assert!(ctl.stop().await);
        assert!(!ctl.stop().await);
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);
        assert_eq!(store.committed(), 1);
        assert!(ctl.status().backend_available);

        // Backend came back: a second session can start.
        let again = ctl.start("/dev/video0", 3).unwrap();
        assert_ne!(again.id, started.id);
        assert!(ctl.stop().await);
    }

    #[tokio::test]
    async fn test_slow_thread_keeps_backend_until_it_exits() {
        let store = Arc::new(ScriptedStore::new(vec![alice()]));
        let opener = Arc::new(LoopOpener::default());
        let backend = SlowBackend {
            inner: FixedBackend::seeing(vec![]),
            delay: Duration::from_millis(300),
        };
        let mut ctl = controller(
            Box::new(backend),
            store,
            opener.clone(),
            PipelineSettings {
                stop_timeout: Duration::from_millis(20),
                ..settings()
            },
        );

        let _started = ctl.start("/dev/video0", 1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctl.stop().await);
        assert!(!ctl.status().running);
        assert!(matches!(
            ctl.start("/dev/video0", 1),
            Err(SessionError::BackendBusy)
        ));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(ctl.status().backend_available);
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);
        assert!(ctl.start("/dev/video0", 1).is_ok());
        ctl.stop().await;
    }

    #[tokio::test]
    async fn test_enroll_only_when_idle() {
        let store = Arc::new(ScriptedStore::new(vec![alice()]));
        let opener = Arc::new(LoopOpener::default());
        let backend = FixedBackend::seeing(vec![vec![0.3, 0.4]]);
        let mut ctl = controller(Box::new(backend), store, opener.clone(), settings());

        let face = ctl.enroll("/dev/video0", 3).unwrap();
        assert_eq!(face.embedding.values, vec![0.3, 0.4]);
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);

        let _started = ctl.start("/dev/video0", 1).unwrap();
        assert!(matches!(
            ctl.enroll("/dev/video0", 3),
            Err(SessionError::AlreadyRunning)
        ));
        ctl.stop().await;
    }

    #[tokio::test]
    async fn test_undrained_reports_do_not_stall_pipeline() {
        let store = Arc::new(ScriptedStore::new(vec![alice()]));
        let opener = Arc::new(LoopOpener::default());
        let mut ctl = controller(
            blind(),
            store,
            opener,
            PipelineSettings {
                report_capacity: 1,
                ..settings()
            },
        );

        let started = ctl.start("/dev/video0", 1).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Never read from `started.reports`; stop must still be prompt.
        assert!(ctl.stop().await);
        assert!(ctl.status().backend_available);
        drop(started);
    }
}
