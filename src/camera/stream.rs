use std::time::Duration;

use tokio::select;
use tokio::sync::{broadcast, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use super::command::{
    CallerId, CameraCommandSink, CameraRequest, CameraResponse, JobId, Origin, Submission,
};
use super::error::CommandError;
use super::interface::Frame;
use super::timelapse::MAX_CONSECUTIVE_FAILURES;

/// Frames buffered per subscriber before a slow one starts lagging.
const FRAME_BUFFER: usize = 16;

/// Caller-side handle for a live preview stream. Frames stop arriving (the
/// channel closes) when the stream ends for any reason.
pub struct StreamHandle {
    id: JobId,
    frames: broadcast::Receiver<Frame>,
}

impl StreamHandle {
    pub(super) fn new(id: JobId, frames: broadcast::Receiver<Frame>) -> Self {
        StreamHandle { id, frames }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn into_frames(self) -> broadcast::Receiver<Frame> {
        self.frames
    }
}

/// The pump behind the `Streaming` state: feeds Preview commands into the
/// dispatcher queue at the frame cadence and fans the frames out.
#[derive(Debug)]
pub struct StreamJob {
    id: JobId,
    owner: CallerId,
    frame_interval: Duration,
    cmd_tx: CameraCommandSink,
    cancel: CancellationToken,
    frames_tx: broadcast::Sender<Frame>,
}

impl StreamJob {
    pub(super) fn new(
        id: JobId,
        owner: CallerId,
        frame_interval: Duration,
        cmd_tx: CameraCommandSink,
        cancel: CancellationToken,
    ) -> (Self, broadcast::Receiver<Frame>) {
        let (frames_tx, frames_rx) = broadcast::channel(FRAME_BUFFER);
        let job = StreamJob {
            id,
            owner,
            frame_interval,
            cmd_tx,
            cancel,
            frames_tx,
        };
        (job, frames_rx)
    }

    pub(super) fn id(&self) -> JobId {
        self.id
    }

    pub(super) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(super) async fn run(self) {
        let origin = Origin::Stream(self.id);
        let mut ticks = time::interval(self.frame_interval);
        let mut failures = 0u32;
        let mut frames = 0u64;

        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }

            match self.preview(origin).await {
                Ok(CameraResponse::Frame(frame)) => {
                    failures = 0;
                    frames += 1;
                    trace!(job = %self.id, frames, "forwarding preview frame");
                    // no subscribers is fine; frames are best-effort
                    let _ = self.frames_tx.send(frame);
                }
                Ok(_) => {}
                Err(CommandError::Cancelled) => break,
                Err(err @ CommandError::Device(_)) | Err(err @ CommandError::InvalidState { .. }) => {
                    warn!(job = %self.id, %err, "stream ended by session failure");
                    break;
                }
                Err(err) => {
                    failures += 1;
                    warn!(job = %self.id, %err, failures, "preview grab failed");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        break;
                    }
                }
            }
        }

        if !self.cancel.is_cancelled() {
            self.send_stop(origin).await;
        }

        info!(job = %self.id, owner = %self.owner, frames, "preview stream ended");
    }

    async fn preview(&self, origin: Origin) -> Result<CameraResponse, CommandError> {
        let (ret_tx, ret_rx) = oneshot::channel();
        let submission = Submission {
            request: CameraRequest::Preview,
            origin,
            cancel: self.cancel.child_token(),
        };

        select! {
            _ = self.cancel.cancelled() => return Err(CommandError::Cancelled),
            sent = self.cmd_tx.send_async((submission, ret_tx)) => {
                if sent.is_err() {
                    return Err(CommandError::Cancelled);
                }
            }
        }

        ret_rx.await.unwrap_or(Err(CommandError::Cancelled))
    }

    async fn send_stop(&self, origin: Origin) {
        let (ret_tx, ret_rx) = oneshot::channel();
        let submission = Submission {
            request: CameraRequest::StopStream,
            origin,
            cancel: CancellationToken::new(),
        };

        if self.cmd_tx.send_async((submission, ret_tx)).await.is_ok() {
            let _ = ret_rx.await;
        }
    }
}
