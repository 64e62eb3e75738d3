use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::{
    CallerId, CameraCommandSink, CameraRequest, CameraResponse, JobId, Origin, Submission,
};
use super::error::CommandError;

/// Consecutive failed captures after which a job gives up instead of
/// hammering a broken camera.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct TimelapseParams {
    pub interval: Duration,
    pub max_shots: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelapseEndReason {
    /// `max_shots` was reached.
    Completed,
    /// An explicit stop, or queue shutdown.
    Stopped,
    /// Terminal failure: repeated capture errors or a disconnect.
    Failed(CommandError),
}

#[derive(Debug, Clone)]
pub struct TimelapseOutcome {
    pub shots_taken: u32,
    pub reason: TimelapseEndReason,
}

/// Owner-side handle for a running timelapse job.
#[derive(Debug)]
pub struct TimelapseHandle {
    id: JobId,
    done: oneshot::Receiver<TimelapseOutcome>,
}

impl TimelapseHandle {
    pub(super) fn new(id: JobId, done: oneshot::Receiver<TimelapseOutcome>) -> Self {
        TimelapseHandle { id, done }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job to end, however it ends. Returns `None` only if the
    /// job task disappeared without reporting.
    pub async fn finished(self) -> Option<TimelapseOutcome> {
        self.done.await.ok()
    }
}

/// The scheduling half of a timelapse. Runs as its own task, feeding
/// Capture commands into the dispatcher queue on a fixed cadence; the
/// dispatcher remains the only component touching the driver.
#[derive(Debug)]
pub struct TimelapseJob {
    id: JobId,
    owner: CallerId,
    params: TimelapseParams,
    cmd_tx: CameraCommandSink,
    cancel: CancellationToken,
    done_tx: oneshot::Sender<TimelapseOutcome>,
}

impl TimelapseJob {
    pub(super) fn new(
        id: JobId,
        owner: CallerId,
        params: TimelapseParams,
        cmd_tx: CameraCommandSink,
        cancel: CancellationToken,
        done_tx: oneshot::Sender<TimelapseOutcome>,
    ) -> Self {
        TimelapseJob {
            id,
            owner,
            params,
            cmd_tx,
            cancel,
            done_tx,
        }
    }

    pub(super) fn id(&self) -> JobId {
        self.id
    }

    pub(super) fn params(&self) -> TimelapseParams {
        self.params
    }

    pub(super) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(super) async fn run(self) {
        let origin = Origin::Timelapse(self.id);

        // Ticks are anchored to the job start, so a slow capture or a
        // backed-up dispatcher does not accumulate drift.
        let mut ticks = time::interval(self.params.interval);

        let mut shots_taken = 0u32;
        let mut failures = 0u32;

        let reason = loop {
            select! {
                _ = self.cancel.cancelled() => break TimelapseEndReason::Stopped,
                _ = ticks.tick() => {}
            }

            match self.capture(origin).await {
                Ok(_) => {
                    shots_taken += 1;
                    failures = 0;
                    debug!(job = %self.id, shots_taken, "timelapse frame captured");
                }
                Err(CommandError::Cancelled) => break TimelapseEndReason::Stopped,
                Err(err @ CommandError::Device(_)) => break TimelapseEndReason::Failed(err),
                Err(err @ CommandError::InvalidState { .. }) => {
                    // the session changed underneath us; nothing to capture
                    break TimelapseEndReason::Failed(err);
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        job = %self.id, %err, failures,
                        "timelapse capture failed ({failures}/{MAX_CONSECUTIVE_FAILURES})"
                    );
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        break TimelapseEndReason::Failed(err);
                    }
                }
            }

            if let Some(max_shots) = self.params.max_shots {
                if shots_taken >= max_shots {
                    break TimelapseEndReason::Completed;
                }
            }
        };

        // Let the dispatcher tear the session down, unless it already did
        // (which is how our token gets cancelled).
        if !self.cancel.is_cancelled() {
            self.send_stop(origin).await;
        }

        info!(
            job = %self.id, owner = %self.owner, shots_taken, reason = ?reason,
            "timelapse ended"
        );

        let _ = self.done_tx.send(TimelapseOutcome {
            shots_taken,
            reason,
        });
    }

    /// Submit one Capture through the regular command queue and wait for
    /// its result. Inspected here, not surfaced per-shot to the owner.
    async fn capture(&self, origin: Origin) -> Result<CameraResponse, CommandError> {
        let (ret_tx, ret_rx) = oneshot::channel();
        let submission = Submission {
            request: CameraRequest::Capture,
            origin,
            // child token: a stopped job withdraws its queued captures too
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

        // the dispatcher resolves every queued sink, even during teardown,
        // so waiting on the result alone cannot hang
        ret_rx.await.unwrap_or(Err(CommandError::Cancelled))
    }

    async fn send_stop(&self, origin: Origin) {
        let (ret_tx, ret_rx) = oneshot::channel();
        let submission = Submission {
            request: CameraRequest::StopTimelapse,
            origin,
            cancel: CancellationToken::new(),
        };

        if self.cmd_tx.send_async((submission, ret_tx)).await.is_ok() {
            // the dispatcher may reject this if the job was already torn
            // down by a caller's stop; either way the session is settled
            let _ = ret_rx.await;
        }
    }
}
