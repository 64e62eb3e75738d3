use std::fmt;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::command::{CommandKind, JobId, Origin};
use super::error::CommandError;

/// The camera's operating mode. Transitions happen only inside the
/// dispatcher loop; everyone else observes snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Busy,
    Streaming,
    TimelapseRunning,
    Disconnected,
}

impl SessionState {
    /// Whether a command submitted by an external caller is legal in this
    /// state. One-shot operations are only accepted from `Idle`; job-origin
    /// commands are validated by the dispatcher against the active job
    /// instead.
    pub fn accepts(self, kind: CommandKind) -> bool {
        use CommandKind::*;

        match kind {
            Capture | SetSetting | Preview | StartTimelapse | StartStream => {
                self == SessionState::Idle
            }
            StopTimelapse => self == SessionState::TimelapseRunning,
            StopStream => self == SessionState::Streaming,
            Reconnect => self == SessionState::Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::Streaming => "streaming",
            SessionState::TimelapseRunning => "running a timelapse",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Read-only view of the session, published over a watch channel after
/// every state change.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub current_operation: Option<CommandKind>,
    pub last_error: Option<String>,
    pub timelapse: Option<JobId>,
    pub stream: Option<JobId>,
}

#[derive(Debug)]
pub(super) struct ActiveJob {
    pub id: JobId,
    pub cancel: CancellationToken,
}

/// The one physical camera, as the dispatcher sees it. Owned exclusively by
/// the dispatcher loop; mutators are deliberately private to this module
/// tree.
#[derive(Debug)]
pub struct CameraSession {
    state: SessionState,
    current_operation: Option<CommandKind>,
    last_error: Option<CommandError>,
    timelapse: Option<ActiveJob>,
    stream: Option<ActiveJob>,
}

impl CameraSession {
    pub(super) fn new() -> Self {
        CameraSession {
            state: SessionState::Idle,
            current_operation: None,
            last_error: None,
            timelapse: None,
            stream: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            current_operation: self.current_operation,
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
            timelapse: self.timelapse.as_ref().map(|j| j.id),
            stream: self.stream.as_ref().map(|j| j.id),
        }
    }

    /// Full validation, including whether a job-origin command actually
    /// belongs to the active job. Used by the dispatcher as the
    /// authoritative check right before execution.
    pub fn can_accept(&self, kind: CommandKind, origin: Origin) -> bool {
        use CommandKind::*;

        match origin {
            Origin::Caller(_) => self.state.accepts(kind),
            Origin::Timelapse(id) => {
                matches!(kind, Capture | StopTimelapse)
                    && self.state == SessionState::TimelapseRunning
                    && self.timelapse.as_ref().map_or(false, |j| j.id == id)
            }
            Origin::Stream(id) => {
                matches!(kind, Preview | StopStream)
                    && self.state == SessionState::Streaming
                    && self.stream.as_ref().map_or(false, |j| j.id == id)
            }
        }
    }

    pub(super) fn rejection(&self) -> CommandError {
        CommandError::InvalidState { state: self.state }
    }

    /// A driver-backed operation is starting. One-shots from `Idle` make
    /// the session `Busy`; job-origin operations keep their running state.
    pub(super) fn begin(&mut self, kind: CommandKind) {
        self.current_operation = Some(kind);
        if self.state == SessionState::Idle {
            self.state = SessionState::Busy;
        }
    }

    /// The in-flight operation finished, successfully or with a recoverable
    /// failure. `Busy` returns to `Idle`; other states are unaffected.
    pub(super) fn settle(&mut self, error: Option<CommandError>) {
        self.current_operation = None;
        if let Some(err) = error {
            self.last_error = Some(err);
        }
        if self.state == SessionState::Busy {
            self.state = SessionState::Idle;
        }
    }

    /// The driver reported a fatal failure. Active jobs die with the
    /// connection.
    pub(super) fn disconnect(&mut self, error: CommandError) {
        self.current_operation = None;
        self.last_error = Some(error);
        self.state = SessionState::Disconnected;
        if let Some(job) = self.timelapse.take() {
            job.cancel.cancel();
        }
        if let Some(job) = self.stream.take() {
            job.cancel.cancel();
        }
    }

    /// An explicit reconnect succeeded.
    pub(super) fn reconnected(&mut self) {
        self.current_operation = None;
        self.last_error = None;
        self.state = SessionState::Idle;
    }

    pub(super) fn timelapse_started(&mut self, job: ActiveJob) {
        debug_assert_eq!(self.state, SessionState::Idle);
        self.timelapse = Some(job);
        self.state = SessionState::TimelapseRunning;
    }

    pub(super) fn timelapse_stopped(&mut self) {
        if let Some(job) = self.timelapse.take() {
            job.cancel.cancel();
        }
        self.state = SessionState::Idle;
    }

    pub(super) fn stream_started(&mut self, job: ActiveJob) {
        debug_assert_eq!(self.state, SessionState::Idle);
        self.stream = Some(job);
        self.state = SessionState::Streaming;
    }

    pub(super) fn stream_stopped(&mut self) {
        if let Some(job) = self.stream.take() {
            job.cancel.cancel();
        }
        self.state = SessionState::Idle;
    }

    /// Queue teardown: stop whatever jobs are still running.
    pub(super) fn shutdown(&mut self) {
        if let Some(job) = self.timelapse.take() {
            job.cancel.cancel();
        }
        if let Some(job) = self.stream.take() {
            job.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::command::CallerId;

    const CALLER: Origin = Origin::Caller(CallerId(42));

    fn session_in(state: SessionState) -> CameraSession {
        let mut session = CameraSession::new();
        session.state = state;
        session
    }

    #[test]
    fn one_shots_only_from_idle() {
        for kind in [
            CommandKind::Capture,
            CommandKind::SetSetting,
            CommandKind::Preview,
        ] {
            assert!(session_in(SessionState::Idle).can_accept(kind, CALLER));
            assert!(!session_in(SessionState::Busy).can_accept(kind, CALLER));
            assert!(!session_in(SessionState::Streaming).can_accept(kind, CALLER));
            assert!(!session_in(SessionState::TimelapseRunning).can_accept(kind, CALLER));
            assert!(!session_in(SessionState::Disconnected).can_accept(kind, CALLER));
        }
    }

    #[test]
    fn start_commands_only_from_idle() {
        for kind in [CommandKind::StartTimelapse, CommandKind::StartStream] {
            assert!(session_in(SessionState::Idle).can_accept(kind, CALLER));
            assert!(!session_in(SessionState::TimelapseRunning).can_accept(kind, CALLER));
            assert!(!session_in(SessionState::Streaming).can_accept(kind, CALLER));
            assert!(!session_in(SessionState::Disconnected).can_accept(kind, CALLER));
        }
    }

    #[test]
    fn stop_commands_need_their_running_state() {
        assert!(session_in(SessionState::TimelapseRunning)
            .can_accept(CommandKind::StopTimelapse, CALLER));
        assert!(!session_in(SessionState::Idle).can_accept(CommandKind::StopTimelapse, CALLER));
        assert!(session_in(SessionState::Streaming).can_accept(CommandKind::StopStream, CALLER));
        assert!(!session_in(SessionState::Idle).can_accept(CommandKind::StopStream, CALLER));
    }

    #[test]
    fn reconnect_only_while_disconnected() {
        assert!(session_in(SessionState::Disconnected).can_accept(CommandKind::Reconnect, CALLER));
        assert!(!session_in(SessionState::Idle).can_accept(CommandKind::Reconnect, CALLER));
    }

    #[test]
    fn job_origin_capture_needs_matching_active_job() {
        let mut session = CameraSession::new();
        session.timelapse_started(ActiveJob {
            id: JobId(7),
            cancel: CancellationToken::new(),
        });

        assert!(session.can_accept(CommandKind::Capture, Origin::Timelapse(JobId(7))));
        assert!(!session.can_accept(CommandKind::Capture, Origin::Timelapse(JobId(8))));
        // callers cannot sneak captures in while a timelapse runs
        assert!(!session.can_accept(CommandKind::Capture, CALLER));
    }

    #[test]
    fn busy_settles_back_to_idle() {
        let mut session = CameraSession::new();
        session.begin(CommandKind::Capture);
        assert_eq!(session.state(), SessionState::Busy);
        session.settle(None);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn settle_does_not_leave_disconnected() {
        let mut session = CameraSession::new();
        session.disconnect(CommandError::Device("gone".into()));
        session.begin(CommandKind::Reconnect);
        session.settle(Some(CommandError::OperationFailed("still gone".into())));
        assert_eq!(session.state(), SessionState::Disconnected);
        session.reconnected();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn disconnect_cancels_active_job() {
        let mut session = CameraSession::new();
        let cancel = CancellationToken::new();
        session.timelapse_started(ActiveJob {
            id: JobId(1),
            cancel: cancel.clone(),
        });

        session.disconnect(CommandError::Device("unplugged".into()));
        assert!(cancel.is_cancelled());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.snapshot().timelapse.is_none());
    }
}
