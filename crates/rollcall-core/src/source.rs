//! Boundary to the frame source (camera).

use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cannot open frame source {selector}: {reason}")]
    Open { selector: String, reason: String },
    #[error("frame read failed: {0}")]
    Read(String),
}

/// An opened camera handle.
pub trait FrameSource: Send {
    /// Next frame. An error is a dropped frame, not the end of the stream.
    fn read(&mut self) -> Result<Frame, SourceError>;

    /// Stop streaming and free the device. Reads after release fail.
    fn release(&mut self);
}

/// Opens a frame source from a selector such as `/dev/video0`.
pub trait FrameSourceOpener: Send + Sync {
    fn open(&self, selector: &str) -> Result<Box<dyn FrameSource>, SourceError>;
}
