use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError};
use serde::Deserialize;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize)]
pub enum CameraKind {
    Dummy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_kind")]
    pub kind: CameraKind,

    /// Per-attempt timeout for a single driver invocation.
    #[serde(with = "serde_millis", default = "default_command_timeout")]
    pub command_timeout: Duration,

    /// Extra attempts when the driver reports a transient failure, e.g. a
    /// busy USB device.
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,

    #[serde(with = "serde_millis", default = "default_busy_retry_delay")]
    pub busy_retry_delay: Duration,

    /// Commands that may sit in the queue before submission starts failing.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Simulated shutter latency of the dummy driver.
    #[serde(with = "serde_millis", default = "default_dummy_latency")]
    pub dummy_latency: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            kind: default_kind(),
            command_timeout: default_command_timeout(),
            busy_retries: default_busy_retries(),
            busy_retry_delay: default_busy_retry_delay(),
            queue_depth: default_queue_depth(),
            dummy_latency: default_dummy_latency(),
        }
    }
}

fn default_kind() -> CameraKind {
    CameraKind::Dummy
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_busy_retries() -> u32 {
    2
}

fn default_busy_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_queue_depth() -> usize {
    64
}

fn default_dummy_latency() -> Duration {
    Duration::from_millis(250)
}

#[derive(Debug, Deserialize)]
pub struct GphotoBotConfig {
    pub camera: CameraConfig,
}

impl GphotoBotConfig {
    pub fn read_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let mut c = Config::new();

        c.merge(config::File::from(path))?;
        c.merge(config::Environment::with_prefix("GPHOTO_BOT"))?;

        c.try_into()
    }
}
