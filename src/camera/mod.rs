mod client;
mod command;
mod dummy;
mod error;
mod interface;
mod session;
mod stream;
mod task;
mod timelapse;

pub use client::CameraClient;
pub use command::{
    CallerId, CameraRequest, CameraResponse, CommandKind, CommandTicket, JobId, Origin, Submission,
};
pub use dummy::DummyCamera;
pub use error::CommandError;
pub use interface::{CameraInterface, CameraStatus, DriverError, DriverErrorKind, Frame, ImageHandle};
pub use session::{SessionSnapshot, SessionState};
pub use stream::StreamHandle;
pub use task::ControlTask;
pub use timelapse::{TimelapseEndReason, TimelapseHandle, TimelapseOutcome, TimelapseParams};

use tokio::sync::watch;

use crate::config::CameraConfig;

/// Build the dispatcher task and the client handle it serves. The task owns
/// the driver interface and the session; clients only submit commands and
/// read snapshots.
pub fn create_task(
    config: CameraConfig,
    interface: Box<dyn CameraInterface>,
) -> anyhow::Result<(ControlTask, CameraClient)> {
    let (cmd_tx, cmd_rx) = flume::bounded(config.queue_depth);

    let session = session::CameraSession::new();
    let (state_tx, state_rx) = watch::channel(session.snapshot());

    let task = ControlTask {
        interface,
        cmd_rx,
        state_tx,
        session,
        config,
    };
    let client = CameraClient::new(cmd_tx, state_rx);

    Ok((task, client))
}
