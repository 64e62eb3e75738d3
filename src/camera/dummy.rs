use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;
use tracing::{debug, info};

use super::interface::{CameraInterface, CameraStatus, DriverError, Frame, ImageHandle};

/// A stand-in for the real libgphoto2 adapter: always connected, answers
/// every call after a simulated shutter latency. Lets the whole controller
/// run without hardware attached.
pub struct DummyCamera {
    latency: Duration,
    shots: u32,
}

impl DummyCamera {
    pub fn new(latency: Duration) -> Self {
        info!(?latency, "using dummy camera driver");
        DummyCamera { latency, shots: 0 }
    }
}

#[async_trait]
impl CameraInterface for DummyCamera {
    async fn capture(&mut self) -> Result<ImageHandle, DriverError> {
        tokio::time::sleep(self.latency).await;
        self.shots += 1;

        let captured_at = Local::now();
        let name = format!("{}.jpg", captured_at.format("%Y%m%d_%H%M%S%f"));
        debug!(%name, shots = self.shots, "dummy capture");

        Ok(ImageHandle { name, captured_at })
    }

    async fn set_setting(&mut self, key: &str, value: &str) -> Result<(), DriverError> {
        tokio::time::sleep(self.latency).await;

        if key.is_empty() {
            return Err(DriverError::transient("empty setting key"));
        }

        debug!(key, value, "dummy set_setting");
        Ok(())
    }

    async fn preview_frame(&mut self) -> Result<Frame, DriverError> {
        tokio::time::sleep(self.latency).await;

        // smallest possible JPEG-shaped payload
        Ok(Frame {
            data: Bytes::from_static(&[0xff, 0xd8, 0xff, 0xd9]),
            captured_at: Local::now(),
        })
    }

    async fn status(&mut self) -> Result<CameraStatus, DriverError> {
        Ok(CameraStatus { connected: true })
    }
}
