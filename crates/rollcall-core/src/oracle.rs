//! Seams to the external face pipeline: where frames come from and how a
//! frame becomes a descriptor.
//!
//! Both traits are synchronous. Implementations typically block on a camera
//! or on model inference, so callers run them off the async executor.

use crate::frame::Frame;
use crate::types::{Descriptor, DescriptorError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("detector failed: {0}")]
    DetectionFailed(String),
    #[error("invalid descriptor from detector: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("frame source exhausted")]
    Exhausted,
}

/// Produces at most one descriptor per frame.
///
/// Frames with no face, or with several faces the detector declines to pick
/// between, yield `Ok(None)`.
pub trait DescriptorOracle: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Option<Descriptor>, OracleError>;
}

/// Supplies frames to the session loop.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<Frame, CaptureError>;
}
