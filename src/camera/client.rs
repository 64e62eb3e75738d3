use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::command::{
    CallerId, CameraCommandSink, CameraRequest, CameraResponse, CommandTicket, JobId, Origin,
    Submission,
};
use super::error::CommandError;
use super::session::SessionSnapshot;
use super::stream::{StreamHandle, StreamJob};
use super::timelapse::{TimelapseHandle, TimelapseJob, TimelapseParams};

/// The interface handed to the front-end (one clone per Discord
/// interaction, typically). Submitting never blocks; waiting for a result
/// suspends only the caller.
#[derive(Clone)]
pub struct CameraClient {
    cmd_tx: CameraCommandSink,
    state_rx: watch::Receiver<SessionSnapshot>,
    next_job_id: Arc<AtomicU64>,
}

impl CameraClient {
    pub(super) fn new(
        cmd_tx: CameraCommandSink,
        state_rx: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        CameraClient {
            cmd_tx,
            state_rx,
            next_job_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Latest session snapshot, as of the last command the dispatcher
    /// finished.
    pub fn state(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Queue a command without waiting for it. Requests that are illegal in
    /// the current session state fail here and never enter the queue; the
    /// dispatcher re-validates at dispatch time regardless.
    pub fn submit(
        &self,
        request: CameraRequest,
        caller: CallerId,
    ) -> Result<CommandTicket, CommandError> {
        let kind = request.kind();
        let state = self.state_rx.borrow().state;
        if !state.accepts(kind) {
            return Err(CommandError::InvalidState { state });
        }

        let cancel = CancellationToken::new();
        let (ret_tx, ret_rx) = oneshot::channel();
        let submission = Submission {
            request,
            origin: Origin::Caller(caller),
            cancel: cancel.clone(),
        };

        self.cmd_tx
            .try_send((submission, ret_tx))
            .map_err(|err| match err {
                flume::TrySendError::Full(_) => {
                    CommandError::OperationFailed("command queue is full".into())
                }
                flume::TrySendError::Disconnected(_) => CommandError::Cancelled,
            })?;

        Ok(CommandTicket::new(kind, cancel, ret_rx))
    }

    /// Queue a command and wait for its result.
    pub async fn command(
        &self,
        request: CameraRequest,
        caller: CallerId,
    ) -> Result<CameraResponse, CommandError> {
        self.submit(request, caller)?.wait().await
    }

    /// Start a timelapse. The returned handle is how the owner learns about
    /// completion or terminal failure; per-shot results stay with the job.
    pub async fn start_timelapse(
        &self,
        params: TimelapseParams,
        owner: CallerId,
    ) -> Result<TimelapseHandle, CommandError> {
        if params.interval.is_zero() {
            return Err(CommandError::OperationFailed(
                "timelapse interval must be positive".into(),
            ));
        }

        let id = self.next_job_id();
        let (done_tx, done_rx) = oneshot::channel();
        let job = TimelapseJob::new(
            id,
            owner,
            params,
            self.cmd_tx.clone(),
            CancellationToken::new(),
            done_tx,
        );

        self.submit(CameraRequest::StartTimelapse(job), owner)?
            .wait()
            .await?;

        Ok(TimelapseHandle::new(id, done_rx))
    }

    pub async fn stop_timelapse(&self, caller: CallerId) -> Result<(), CommandError> {
        self.command(CameraRequest::StopTimelapse, caller)
            .await
            .map(|_| ())
    }

    /// Start a live preview stream at the given frame cadence.
    pub async fn start_stream(
        &self,
        frame_interval: Duration,
        owner: CallerId,
    ) -> Result<StreamHandle, CommandError> {
        if frame_interval.is_zero() {
            return Err(CommandError::OperationFailed(
                "frame interval must be positive".into(),
            ));
        }

        let id = self.next_job_id();
        let (job, frames_rx) = StreamJob::new(
            id,
            owner,
            frame_interval,
            self.cmd_tx.clone(),
            CancellationToken::new(),
        );

        self.submit(CameraRequest::StartStream(job), owner)?
            .wait()
            .await?;

        Ok(StreamHandle::new(id, frames_rx))
    }

    pub async fn stop_stream(&self, caller: CallerId) -> Result<(), CommandError> {
        self.command(CameraRequest::StopStream, caller)
            .await
            .map(|_| ())
    }

    fn next_job_id(&self) -> JobId {
        JobId(self.next_job_id.fetch_add(1, Ordering::Relaxed))
    }
}
