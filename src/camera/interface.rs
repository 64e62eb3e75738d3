use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;

/// Distinguishes a retryable hardware hiccup from an unrecoverable
/// disconnection. The dispatcher uses this to decide whether the session
/// survives a failed driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Transient,
    Fatal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn transient(message: impl Into<String>) -> Self {
        DriverError {
            kind: DriverErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        DriverError {
            kind: DriverErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == DriverErrorKind::Fatal
    }
}

/// Reference to a captured image. Persistence of the actual image data is
/// the caller's responsibility; the controller only hands over the name.
#[derive(Debug, Clone, Serialize)]
pub struct ImageHandle {
    pub name: String,
    pub captured_at: DateTime<Local>,
}

/// A single preview frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub captured_at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy)]
pub struct CameraStatus {
    pub connected: bool,
}

/// Boundary wrapper around the camera hardware SDK. Exactly one dispatcher
/// task holds the implementation; nothing else talks to the hardware.
#[async_trait]
pub trait CameraInterface: Send {
    async fn capture(&mut self) -> Result<ImageHandle, DriverError>;

    async fn set_setting(&mut self, key: &str, value: &str) -> Result<(), DriverError>;

    async fn preview_frame(&mut self) -> Result<Frame, DriverError>;

    async fn status(&mut self) -> Result<CameraStatus, DriverError>;
}
