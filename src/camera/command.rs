use std::fmt;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::client::{ChannelCommandSink, ChannelCommandSource};

use super::error::CommandError;
use super::interface::{Frame, ImageHandle};
use super::stream::StreamJob;
use super::timelapse::TimelapseJob;

/// Identity of an external caller, e.g. a Discord user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CallerId(pub u64);

impl CallerId {
    /// The local interactive console.
    pub const CONSOLE: CallerId = CallerId(0);
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

/// Identity of a timelapse or stream job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Where a command came from. Periodic captures and preview grabs issued by
/// the active job are legal in states where the same command from an
/// external caller is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Caller(CallerId),
    Timelapse(JobId),
    Stream(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    Capture,
    SetSetting,
    Preview,
    StartTimelapse,
    StopTimelapse,
    StartStream,
    StopStream,
    Reconnect,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Capture => "capture",
            CommandKind::SetSetting => "set-setting",
            CommandKind::Preview => "preview",
            CommandKind::StartTimelapse => "start-timelapse",
            CommandKind::StopTimelapse => "stop-timelapse",
            CommandKind::StartStream => "start-stream",
            CommandKind::StopStream => "stop-stream",
            CommandKind::Reconnect => "reconnect",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum CameraRequest {
    Capture,
    SetSetting { key: String, value: String },
    Preview,
    StartTimelapse(TimelapseJob),
    StopTimelapse,
    StartStream(StreamJob),
    StopStream,
    Reconnect,
}

impl CameraRequest {
    pub fn kind(&self) -> CommandKind {
        match self {
            CameraRequest::Capture => CommandKind::Capture,
            CameraRequest::SetSetting { .. } => CommandKind::SetSetting,
            CameraRequest::Preview => CommandKind::Preview,
            CameraRequest::StartTimelapse(_) => CommandKind::StartTimelapse,
            CameraRequest::StopTimelapse => CommandKind::StopTimelapse,
            CameraRequest::StartStream(_) => CommandKind::StartStream,
            CameraRequest::StopStream => CommandKind::StopStream,
            CameraRequest::Reconnect => CommandKind::Reconnect,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CameraResponse {
    Unit,
    Image(ImageHandle),
    Frame(Frame),
    TimelapseStarted { job: JobId },
    StreamStarted { job: JobId },
}

/// A request together with its provenance and a token the caller can use to
/// withdraw it while it is still queued.
#[derive(Debug)]
pub struct Submission {
    pub request: CameraRequest,
    pub origin: Origin,
    pub cancel: CancellationToken,
}

pub type CameraCommandSink = ChannelCommandSink<Submission, CameraResponse, CommandError>;
pub type CameraCommandSource = ChannelCommandSource<Submission, CameraResponse, CommandError>;

/// Caller-side handle to a queued command.
#[derive(Debug)]
pub struct CommandTicket {
    kind: CommandKind,
    cancel: CancellationToken,
    response: oneshot::Receiver<Result<CameraResponse, CommandError>>,
}

impl CommandTicket {
    pub(super) fn new(
        kind: CommandKind,
        cancel: CancellationToken,
        response: oneshot::Receiver<Result<CameraResponse, CommandError>>,
    ) -> Self {
        CommandTicket {
            kind,
            cancel,
            response,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Withdraw the command if it has not been dispatched yet. Has no
    /// effect on a command that is already in flight; the caller still gets
    /// that command's real result.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the command to resolve. Every submitted command resolves
    /// exactly once; a dispatcher that went away without answering counts
    /// as cancellation.
    pub async fn wait(self) -> Result<CameraResponse, CommandError> {
        match self.response.await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Cancelled),
        }
    }
}
