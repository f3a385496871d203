//! rollcall-core: face identification and attendance deduplication.
//!
//! Two interchangeable embedding backends (SCRFD + ArcFace over ONNX
//! Runtime, and a SeetaFace cascade with raw-pixel embeddings), a shared
//! gallery, nearest-neighbour matching, per-identity cooldowns and the
//! per-frame pipeline that ties them together.

pub mod alignment;
pub mod backend;
pub mod commit;
pub mod cooldown;
pub mod detector;
pub mod enroll;
pub mod frame;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod pixel;
pub mod recognizer;
pub mod session;
pub mod source;
pub mod store;
pub mod types;

pub use backend::{BackendError, DetectionScales, EmbeddingBackend, MatchPolicy, Purpose};
pub use cooldown::{Clock, Cooldown, SystemClock};
pub use frame::Frame;
pub use gallery::Gallery;
pub use pipeline::{FrameReport, PipelineSettings};
pub use session::{SessionController, SessionError, SessionStatus, StartedSession};
pub use source::{FrameSource, FrameSourceOpener, SourceError};
pub use store::{AttendanceStore, CommitError, StoreError};
pub use types::{
    AnnotatedDetection, AttendanceEvent, BackendKind, ContextId, DetectionResult, DetectionStatus,
    Embedding, FaceRegion, GalleryEntry, Identity, IdentityKey,
};
