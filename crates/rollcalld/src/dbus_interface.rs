use crate::config::Config;
use crate::store::{DbError, Registration, SqliteStore};
use chrono::{DateTime, Utc};
use rollcall_core::{DetectionStatus, FrameReport, Identity, SessionController, SessionError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use zbus::interface;

/// How many new attendance events `Recent` reports.
pub const RECENT_CAPACITY: usize = 10;

/// One committed attendance event, as shown to clients.
#[derive(Debug, Clone, Serialize)]
pub struct RecentEvent {
    pub session: Uuid,
    pub identity: String,
    pub label: String,
    pub confidence: f32,
    pub at: DateTime<Utc>,
}

/// Bounded newest-first log of new attendance events.
#[derive(Default)]
pub struct RecentLog {
    events: StdMutex<VecDeque<RecentEvent>>,
}

impl RecentLog {
    pub fn push(&self, event: RecentEvent) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        events.push_front(event);
        events.truncate(RECENT_CAPACITY);
    }

    pub fn snapshot(&self) -> Vec<RecentEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }

    /// Record the `new-event` detections of one frame report.
    pub fn record(&self, report: &FrameReport) {
        for det in &report.detections {
            if det.status != DetectionStatus::NewEvent {
                continue;
            }
            let Some(identity) = &det.identity else {
                continue;
            };
            self.push(RecentEvent {
                session: report.session,
                identity: identity.to_string(),
                label: det.label.clone(),
                confidence: det.confidence,
                at: report.timestamp,
            });
        }
    }
}

/// Consume a session's reports until the session ends.
pub async fn drain_reports(mut reports: mpsc::Receiver<FrameReport>, recent: Arc<RecentLog>) {
    let mut frames = 0u64;
    while let Some(report) = reports.recv().await {
        frames += 1;
        recent.record(&report);
    }
    tracing::debug!(frames, "report stream closed");
}

/// D-Bus interface for the Rollcall kiosk daemon.
///
/// Bus name: org.rollcall.Kiosk1
/// Object path: /org/rollcall/Kiosk1
pub struct KioskService {
    pub controller: Arc<Mutex<SessionController>>,
    pub store: Arc<SqliteStore>,
    pub recent: Arc<RecentLog>,
    pub config: Arc<Config>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn session_error(e: SessionError) -> zbus::fdo::Error {
    match e {
        SessionError::Source(_) => zbus::fdo::Error::FileNotFound(e.to_string()),
        other => failed(other),
    }
}

fn db_error(e: DbError) -> zbus::fdo::Error {
    match e {
        DbError::DuplicateIdentity(_)
        | DbError::DuplicateEmail(_)
        | DbError::DuplicateRoll { .. }
        | DbError::UnknownClass(_)
        | DbError::DuplicateClass(_)
        | DbError::DuplicateContext(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        DbError::Sqlite(_) | DbError::Io(..) => failed(e),
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Empty or blank strings mean "not given".
fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Registration details from D-Bus arguments; a class id of 0 or less means none.
fn registration(class_id: i64, roll_no: &str, email: &str) -> zbus::fdo::Result<Registration> {
    let email = optional(email);
    if let Some(email) = &email {
        if !email.contains('@') {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "{email:?} is not an email address"
            )));
        }
    }
    Ok(Registration {
        class_id: (class_id > 0).then_some(class_id),
        roll_no: optional(roll_no),
        email,
    })
}

impl KioskService {
    fn camera_or_default(&self, camera: &str) -> String {
        if camera.trim().is_empty() {
            self.config.camera_device.clone()
        } else {
            camera.to_string()
        }
    }
}

#[interface(name = "org.rollcall.Kiosk1")]
impl KioskService {
    /// Start a recognition session. An empty camera string uses the
    /// configured device. Returns the session id.
    async fn start(&self, camera: &str, context_id: i64) -> zbus::fdo::Result<String> {
        let camera = self.camera_or_default(camera);
        tracing::info!(camera = %camera, context = context_id, "start requested");

        if !self.store.context_exists(context_id).map_err(db_error)? {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "unknown context {context_id}"
            )));
        }

        // Opening the camera and loading the gallery block; keep them off the executor.
        let mut controller = Arc::clone(&self.controller).lock_owned().await;
        let started = tokio::task::spawn_blocking(move || controller.start(&camera, context_id))
            .await
            .map_err(failed)?
            .map_err(session_error)?;

        tokio::spawn(drain_reports(started.reports, Arc::clone(&self.recent)));
        Ok(started.id.to_string())
    }

    /// Stop the running session. Returns false when none was running.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        Ok(self.controller.lock().await.stop().await)
    }

    /// Daemon and session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let session = self.controller.lock().await.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": session,
            "cooldown_secs": self.config.cooldown_secs,
            "sample_every": self.config.sample_every,
            "camera_default": self.config.camera_device,
        })
        .to_string())
    }

    /// The last new attendance events, newest first, as JSON.
    async fn recent(&self) -> zbus::fdo::Result<String> {
        to_json(&self.recent.snapshot())
    }

    /// Attendance rows from the database, newest first, as JSON.
    async fn history(&self, limit: u32) -> zbus::fdo::Result<String> {
        to_json(&self.store.recent_attendance(limit.clamp(1, 1000)).map_err(db_error)?)
    }

    /// Capture one face from the default camera and enroll it as a new
    /// identity. `class_id` of 0, an empty roll number or an empty email
    /// leave that detail unset. Refused while a session is running.
    async fn enroll(
        &self,
        key: &str,
        name: &str,
        class_id: i64,
        roll_no: &str,
        email: &str,
    ) -> zbus::fdo::Result<String> {
        let key = key.trim();
        if key.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "identity key must not be empty".into(),
            ));
        }
        let registration = registration(class_id, roll_no, email)?;
        tracing::info!(identity = key, class = ?registration.class_id, "enroll requested");
        // Fail before the capture when the details can never be stored.
        self.store
            .check_registration(key, &registration)
            .map_err(db_error)?;

        let camera = self.config.camera_device.clone();
        let attempts = self.config.enroll_attempts;
        let mut controller = Arc::clone(&self.controller).lock_owned().await;
        let face = tokio::task::spawn_blocking(move || controller.enroll(&camera, attempts))
            .await
            .map_err(failed)?
            .map_err(session_error)?;

        let identity = Identity::new(key, name);
        self.store
            .enroll(&identity, &registration, &face.embedding)
            .map_err(db_error)?;

        Ok(serde_json::json!({
            "key": identity.key,
            "name": identity.name,
            "class_id": registration.class_id,
            "roll_no": registration.roll_no,
            "email": registration.email,
            "backend": face.embedding.backend,
            "dim": face.embedding.dim(),
            "score": face.score,
            "region": face.region,
        })
        .to_string())
    }

    /// Create a class people can be registered in. Returns its id.
    async fn add_class(&self, name: &str) -> zbus::fdo::Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "class name must not be empty".into(),
            ));
        }
        let id = self.store.add_class(name).map_err(db_error)?;
        tracing::info!(class = id, name, "class created");
        Ok(id)
    }

    async fn list_classes(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.list_classes().map_err(db_error)?)
    }

    /// Create an attendance context (class, subject). Returns its id.
    async fn add_context(&self, name: &str) -> zbus::fdo::Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "context name must not be empty".into(),
            ));
        }
        let id = self.store.add_context(name).map_err(db_error)?;
        tracing::info!(context = id, name, "context created");
        Ok(id)
    }

    async fn list_contexts(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.list_contexts().map_err(db_error)?)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.list_identities().map_err(db_error)?)
    }
}
