use super::session::SessionState;

/// What a caller gets back when a command does not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The command is not legal while the session is in this state.
    #[error("the camera is {state} right now")]
    InvalidState { state: SessionState },

    /// The operation ran and failed, but the camera is still usable.
    #[error("camera operation failed: {0}")]
    OperationFailed(String),

    /// The camera is gone; the session is disconnected until an explicit
    /// reconnect succeeds.
    #[error("camera device error: {0}")]
    Device(String),

    /// The command was withdrawn before it ran, or the controller shut
    /// down underneath it.
    #[error("command was cancelled")]
    Cancelled,
}
