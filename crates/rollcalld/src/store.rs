//! SQLite persistence: classes, identities with their registration
//! details, per-backend embeddings, contexts and the attendance log.

use chrono::{DateTime, Utc};
use rollcall_core::store::{AttendanceStore, CommitError, StoreError};
use rollcall_core::{
    AttendanceEvent, BackendKind, ContextId, Embedding, GalleryEntry, Identity,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS classes (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS identities (
    key         TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    class_id    INTEGER REFERENCES classes(id),
    roll_no     TEXT,
    email       TEXT UNIQUE COLLATE NOCASE,
    enrolled_at INTEGER NOT NULL,
    UNIQUE (class_id, roll_no)
);
CREATE TABLE IF NOT EXISTS embeddings (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_key TEXT NOT NULL REFERENCES identities(key) ON DELETE CASCADE,
    backend      TEXT NOT NULL,
    dim          INTEGER NOT NULL,
    vector       BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS embeddings_backend ON embeddings(backend);
CREATE TABLE IF NOT EXISTS contexts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_key TEXT NOT NULL REFERENCES identities(key),
    context_id   INTEGER NOT NULL REFERENCES contexts(id),
    logged_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS attendance_lookup
    ON attendance(identity_key, context_id, logged_at_ms);
";

/// Id of a class (the group a person is registered in).
pub type ClassId = i64;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create {0}: {1}")]
    Io(String, std::io::Error),
    #[error("identity {0} is already enrolled")]
    DuplicateIdentity(String),
    #[error("email {0} is already registered")]
    DuplicateEmail(String),
    #[error("roll number {roll_no} already exists in class {class_id}")]
    DuplicateRoll { class_id: ClassId, roll_no: String },
    #[error("no class with id {0}")]
    UnknownClass(ClassId),
    #[error("class {0:?} already exists")]
    DuplicateClass(String),
    #[error("context {0:?} already exists")]
    DuplicateContext(String),
}

/// Optional registration details stored alongside an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    pub class_id: Option<ClassId>,
    pub roll_no: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassRecord {
    pub id: ClassId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextRecord {
    pub id: ContextId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityRecord {
    pub key: String,
    pub name: String,
    pub class_id: Option<ClassId>,
    pub roll_no: Option<String>,
    pub email: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub embeddings: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub name: String,
    pub context_id: ContextId,
    pub logged_at: DateTime<Utc>,
}

/// SQLite-backed store. One connection behind a mutex; every call is short.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    /// Attendance rows closer together than this are the same event.
    window: chrono::Duration,
}

impl SqliteStore {
    pub fn open(path: &Path, window: chrono::Duration) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbError::Io(parent.display().to_string(), e))?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn, window)
    }

    pub fn open_in_memory(window: chrono::Duration) -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?, window)
    }

    fn init(conn: Connection, window: chrono::Duration) -> Result<Self, DbError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            window,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_class(&self, name: &str) -> Result<ClassId, DbError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO classes (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().timestamp_millis()],
        )?;
        if inserted == 0 {
            return Err(DbError::DuplicateClass(name.to_string()));
        }
        Ok(conn.last_insert_rowid())
    }

    /// Classes ordered by name.
    pub fn list_classes(&self) -> Result<Vec<ClassRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM classes ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(ClassRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: from_millis(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn add_context(&self, name: &str) -> Result<ContextId, DbError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO contexts (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().timestamp_millis()],
        )?;
        if inserted == 0 {
            return Err(DbError::DuplicateContext(name.to_string()));
        }
        Ok(conn.last_insert_rowid())
    }

    pub fn context_exists(&self, id: ContextId) -> Result<bool, DbError> {
        Ok(exists(
            &self.conn(),
            "SELECT 1 FROM contexts WHERE id = ?1",
            params![id],
        )?)
    }

    pub fn list_contexts(&self) -> Result<Vec<ContextRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM contexts ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ContextRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: from_millis(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Check that `key` and `registration` could be enrolled right now.
    pub fn check_registration(
        &self,
        key: &str,
        registration: &Registration,
    ) -> Result<(), DbError> {
        check_registration(&self.conn(), key, registration)
    }

    /// Create `identity` with its registration details and first embedding.
    pub fn enroll(
        &self,
        identity: &Identity,
        registration: &Registration,
        embedding: &Embedding,
    ) -> Result<(), DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        check_registration(&tx, &identity.key.0, registration)?;
        tx.execute(
            "INSERT INTO identities (key, name, class_id, roll_no, email, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity.key.0,
                identity.name,
                registration.class_id,
                registration.roll_no,
                registration.email,
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.execute(
            "INSERT INTO embeddings (identity_key, backend, dim, vector)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identity.key.0,
                embedding.backend.as_str(),
                embedding.dim() as i64,
                encode_vector(&embedding.values)
            ],
        )?;
        tx.commit()?;
        tracing::info!(
            identity = %identity.key,
            class = ?registration.class_id,
            backend = %embedding.backend,
            dim = embedding.dim(),
            "identity enrolled"
        );
        Ok(())
    }

    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT i.key, i.name, i.class_id, i.roll_no, i.email, i.enrolled_at, COUNT(e.id)
             FROM identities i LEFT JOIN embeddings e ON e.identity_key = i.key
             GROUP BY i.key ORDER BY i.key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentityRecord {
                key: row.get(0)?,
                name: row.get(1)?,
                class_id: row.get(2)?,
                roll_no: row.get(3)?,
                email: row.get(4)?,
                enrolled_at: from_millis(row.get(5)?),
                embeddings: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Most recent attendance rows, newest first.
    pub fn recent_attendance(&self, limit: u32) -> Result<Vec<AttendanceRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.identity_key, i.name, a.context_id, a.logged_at_ms
             FROM attendance a JOIN identities i ON i.key = a.identity_key
             ORDER BY a.logged_at_ms DESC, a.id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(AttendanceRecord {
                identity: row.get(0)?,
                name: row.get(1)?,
                context_id: row.get(2)?,
                logged_at: from_millis(row.get(3)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn exists(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<bool> {
    Ok(conn.query_row(sql, params, |_| Ok(())).optional()?.is_some())
}

/// Uniqueness and reference checks, in the order a registrar would fix them.
fn check_registration(
    conn: &Connection,
    key: &str,
    registration: &Registration,
) -> Result<(), DbError> {
    if exists(conn, "SELECT 1 FROM identities WHERE key = ?1", params![key])? {
        return Err(DbError::DuplicateIdentity(key.to_string()));
    }
    if let Some(email) = &registration.email {
        if exists(conn, "SELECT 1 FROM identities WHERE email = ?1", params![email])? {
            return Err(DbError::DuplicateEmail(email.clone()));
        }
    }
    if let Some(class_id) = registration.class_id {
        if !exists(conn, "SELECT 1 FROM classes WHERE id = ?1", params![class_id])? {
            return Err(DbError::UnknownClass(class_id));
        }
        if let Some(roll_no) = &registration.roll_no {
            let taken = exists(
                conn,
                "SELECT 1 FROM identities WHERE class_id = ?1 AND roll_no = ?2",
                params![class_id, roll_no],
            )?;
            if taken {
                return Err(DbError::DuplicateRoll {
                    class_id,
                    roll_no: roll_no.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Constraint violations (unknown identity or context) can never succeed
/// on retry; everything else might.
fn commit_error(e: rusqlite::Error) -> CommitError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            CommitError::Rejected(e.to_string())
        }
        _ => CommitError::Transient(e.to_string()),
    }
}

impl AttendanceStore for SqliteStore {
    fn load_gallery(&self, backend: BackendKind) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT i.key, i.name, e.vector
                 FROM embeddings e JOIN identities i ON i.key = e.identity_key
                 WHERE e.backend = ?1 ORDER BY e.id",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows = stmt
            .query_map(params![backend.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, name, blob) = row.map_err(|e| StoreError::Backend(e.to_string()))?;
            let values = decode_vector(&blob).ok_or_else(|| {
                StoreError::Corrupt(format!("embedding for {key} is {} bytes", blob.len()))
            })?;
            entries.push(GalleryEntry {
                identity: Identity::new(key, name),
                embedding: Embedding::new(values, backend),
            });
        }
        Ok(entries)
    }

    fn commit_attendance(&self, event: &AttendanceEvent) -> Result<(), CommitError> {
        let at_ms = event.timestamp.timestamp_millis();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO attendance (identity_key, context_id, logged_at_ms)
                 SELECT ?1, ?2, ?3
                 WHERE NOT EXISTS (
                     SELECT 1 FROM attendance
                     WHERE identity_key = ?1 AND context_id = ?2 AND logged_at_ms > ?3 - ?4
                 )",
                params![
                    event.identity.key.0,
                    event.context_id,
                    at_ms,
                    self.window.num_milliseconds()
                ],
            )
            .map_err(commit_error)?;

        if inserted == 0 {
            return Err(CommitError::AlreadyLogged);
        }
        Ok(())
    }
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::RgbImage;
    use rollcall_core::commit::CommitWorker;
    use rollcall_core::pipeline::Pipeline;
    use rollcall_core::{
        BackendError, DetectionResult, DetectionStatus, EmbeddingBackend, FaceRegion, Frame,
        Gallery, MatchPolicy, PipelineSettings, Purpose, SystemClock,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(chrono::Duration::seconds(300)).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(key: &str, context_id: ContextId, secs: i64) -> AttendanceEvent {
        AttendanceEvent {
            identity: Identity::new(key, key),
            context_id,
            timestamp: at(secs),
        }
    }

    fn enroll(store: &SqliteStore, key: &str, values: Vec<f32>, backend: BackendKind) {
        store
            .enroll(
                &Identity::new(key, format!("Student {key}")),
                &Registration::default(),
                &Embedding::new(values, backend),
            )
            .unwrap();
    }

    fn register(
        store: &SqliteStore,
        key: &str,
        registration: Registration,
    ) -> Result<(), DbError> {
        store.enroll(
            &Identity::new(key, key),
            &registration,
            &Embedding::new(vec![1.0], BackendKind::ArcFace),
        )
    }

    fn in_class(class_id: ClassId, roll_no: &str, email: &str) -> Registration {
        Registration {
            class_id: Some(class_id),
            roll_no: Some(roll_no.to_string()),
            email: Some(email.to_string()),
        }
    }

    #[test]
    fn test_gallery_filters_by_backend_and_keeps_order() {
        let s = store();
        enroll(&s, "b", vec![0.5, -1.0], BackendKind::ArcFace);
        enroll(&s, "a", vec![1.0, 2.0], BackendKind::ArcFace);
        enroll(&s, "c", vec![3.0; 4], BackendKind::Pixel);

        let arc = s.load_gallery(BackendKind::ArcFace).unwrap();
        assert_eq!(arc.len(), 2);
        assert_eq!(arc[0].identity.key.0, "b");
        assert_eq!(arc[0].identity.name, "Student b");
        assert_eq!(arc[0].embedding.values, vec![0.5, -1.0]);
        assert_eq!(arc[1].embedding.backend, BackendKind::ArcFace);

        let pixel = s.load_gallery(BackendKind::Pixel).unwrap();
        assert_eq!(pixel.len(), 1);
        assert_eq!(pixel[0].embedding.dim(), 4);
    }

    #[test]
    fn test_duplicate_enrollment_rejected() {
        let s = store();
        enroll(&s, "a", vec![1.0], BackendKind::ArcFace);
        let err = register(&s, "a", Registration::default()).unwrap_err();
        assert!(matches!(err, DbError::DuplicateIdentity(k) if k == "a"));
        assert!(matches!(
            s.check_registration("a", &Registration::default()),
            Err(DbError::DuplicateIdentity(_))
        ));
        assert_eq!(s.list_identities().unwrap()[0].embeddings, 1);
    }

    #[test]
    fn test_registration_details_are_stored() {
        let s = store();
        let class = s.add_class("FY-A").unwrap();
        register(&s, "F22113001", in_class(class, "101", "john@example.com")).unwrap();

        let ids = s.list_identities().unwrap();
        assert_eq!(ids[0].class_id, Some(class));
        assert_eq!(ids[0].roll_no.as_deref(), Some("101"));
        assert_eq!(ids[0].email.as_deref(), Some("john@example.com"));
    }

    #[test]
    fn test_email_must_be_unique() {
        let s = store();
        let class = s.add_class("FY-A").unwrap();
        register(&s, "p1", in_class(class, "1", "ann@example.com")).unwrap();

        let err = register(&s, "p2", in_class(class, "2", "ANN@example.com")).unwrap_err();
        assert!(matches!(err, DbError::DuplicateEmail(_)));
        assert_eq!(s.list_identities().unwrap().len(), 1);
    }

    #[test]
    fn test_roll_number_unique_within_class_only() {
        let s = store();
        let a = s.add_class("FY-A").unwrap();
        let b = s.add_class("FY-B").unwrap();
        register(&s, "p1", in_class(a, "7", "p1@example.com")).unwrap();

        let err = register(&s, "p2", in_class(a, "7", "p2@example.com")).unwrap_err();
        assert!(matches!(
            err,
            DbError::DuplicateRoll { class_id, ref roll_no } if class_id == a && roll_no == "7"
        ));
        register(&s, "p3", in_class(b, "7", "p3@example.com")).unwrap();
    }

    #[test]
    fn test_unknown_class_rejected_before_capture() {
        let s = store();
        let reg = Registration {
            class_id: Some(99),
            ..Registration::default()
        };
        assert!(matches!(
            s.check_registration("p1", &reg),
            Err(DbError::UnknownClass(99))
        ));
        assert!(matches!(register(&s, "p1", reg), Err(DbError::UnknownClass(99))));
    }

    #[test]
    fn test_classes_listed_by_name() {
        let s = store();
        s.add_class("SY-B").unwrap();
        s.add_class("FY-A").unwrap();
        assert!(matches!(s.add_class("FY-A"), Err(DbError::DuplicateClass(_))));
        let names: Vec<String> = s.list_classes().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["FY-A", "SY-B"]);
    }

    #[test]
    fn test_commit_is_idempotent_within_window() {
        let s = store();
        enroll(&s, "a", vec![1.0], BackendKind::ArcFace);
        let ctx = s.add_context("Algebra").unwrap();

        assert_eq!(s.commit_attendance(&event("a", ctx, 0)), Ok(()));
        assert_eq!(
            s.commit_attendance(&event("a", ctx, 10)),
            Err(CommitError::AlreadyLogged)
        );
        assert_eq!(s.commit_attendance(&event("a", ctx, 300)), Ok(()));

        let recent = s.recent_attendance(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].logged_at, at(300));
        assert_eq!(recent[1].name, "Student a");
    }

    #[test]
    fn test_window_is_per_context() {
        let s = store();
        enroll(&s, "a", vec![1.0], BackendKind::ArcFace);
        let math = s.add_context("Math").unwrap();
        let art = s.add_context("Art").unwrap();
        assert_eq!(s.commit_attendance(&event("a", math, 0)), Ok(()));
        assert_eq!(s.commit_attendance(&event("a", art, 1)), Ok(()));
    }

    #[test]
    fn test_unknown_identity_or_context_is_rejected() {
        let s = store();
        enroll(&s, "a", vec![1.0], BackendKind::ArcFace);
        let ctx = s.add_context("Math").unwrap();
        assert!(matches!(
            s.commit_attendance(&event("ghost", ctx, 0)),
            Err(CommitError::Rejected(_))
        ));
        assert!(matches!(
            s.commit_attendance(&event("a", ctx + 100, 0)),
            Err(CommitError::Rejected(_))
        ));
        assert!(s.recent_attendance(10).unwrap().is_empty());
    }

    #[test]
    fn test_contexts() {
        let s = store();
        let id = s.add_context("Biology").unwrap();
        assert!(s.context_exists(id).unwrap());
        assert!(!s.context_exists(id + 100).unwrap());
        assert!(matches!(s.add_context("Biology"), Err(DbError::DuplicateContext(_))));
        let all = s.list_contexts().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Biology");
    }

    #[test]
    fn test_corrupt_blob_reported() {
        let s = store();
        enroll(&s, "a", vec![1.0], BackendKind::ArcFace);
        s.conn()
            .execute("UPDATE embeddings SET vector = x'010203'", [])
            .unwrap();
        assert!(matches!(
            s.load_gallery(BackendKind::ArcFace),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let values = vec![0.0, -1.5, 3.25, f32::MAX];
        assert_eq!(decode_vector(&encode_vector(&values)).unwrap(), values);
        assert!(decode_vector(&[]).is_none());
    }

    /// Holds its first write back for `stall`, then lets it land.
    struct StallingStore {
        inner: SqliteStore,
        stall: Duration,
        stalled: AtomicBool,
    }

    impl AttendanceStore for StallingStore {
        fn load_gallery(&self, backend: BackendKind) -> Result<Vec<GalleryEntry>, StoreError> {
            self.inner.load_gallery(backend)
        }

        fn commit_attendance(&self, event: &AttendanceEvent) -> Result<(), CommitError> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(self.stall);
            }
            self.inner.commit_attendance(event)
        }
    }

    /// Sees the same face on every frame.
    struct StillFace(Vec<f32>);

    impl EmbeddingBackend for StillFace {
        fn kind(&self) -> BackendKind {
            BackendKind::ArcFace
        }

        fn policy(&self) -> MatchPolicy {
            MatchPolicy {
                threshold: 0.5,
                confidence_scale: 1.0,
            }
        }

        fn detect(
            &mut self,
            _frame: &RgbImage,
            _purpose: Purpose,
        ) -> Result<Vec<DetectionResult>, BackendError> {
            Ok(vec![DetectionResult {
                region: FaceRegion {
                    top: 0,
                    right: 16,
                    bottom: 16,
                    left: 0,
                },
                embedding: Embedding::new(self.0.clone(), BackendKind::ArcFace),
                score: 1.0,
            }])
        }
    }

    #[test]
    fn test_late_write_after_timeout_is_logged_once() {
        let sqlite = store();
        enroll(&sqlite, "a", vec![0.0, 0.0], BackendKind::ArcFace);
        let ctx = sqlite.add_context("Physics").unwrap();
        let store = Arc::new(StallingStore {
            inner: sqlite,
            stall: Duration::from_millis(300),
            stalled: AtomicBool::new(false),
        });

        let settings = PipelineSettings {
            sample_every: 1,
            commit_timeout: Duration::from_millis(50),
            ..PipelineSettings::default()
        };
        let gallery = Arc::new(Gallery::new());
        gallery
            .replace(BackendKind::ArcFace, store.load_gallery(BackendKind::ArcFace).unwrap())
            .unwrap();
        let worker = CommitWorker::spawn(store.clone(), settings.commit_timeout).unwrap();
        let mut pipeline = Pipeline::new(
            Uuid::new_v4(),
            ctx,
            Box::new(StillFace(vec![0.0, 0.1])),
            gallery,
            worker,
            Arc::new(SystemClock),
            &settings,
        );

        let first = pipeline.handle_frame(Frame::new(RgbImage::new(32, 32), 1));
        assert_eq!(first.detections[0].status, DetectionStatus::CommitFailed);

        // The stalled write lands after its caller gave up on it.
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(store.inner.recent_attendance(10).unwrap().len(), 1);

        let second = pipeline.handle_frame(Frame::new(RgbImage::new(32, 32), 2));
        assert_eq!(second.detections[0].status, DetectionStatus::Duplicate);
        assert_eq!(store.inner.recent_attendance(10).unwrap().len(), 1);
    }
}
