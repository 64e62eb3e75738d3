use async_trait::async_trait;
use tokio::select;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Task;
use crate::config::CameraConfig;

use super::command::{
    CameraCommandSource, CameraRequest, CameraResponse, CommandKind, Origin, Submission,
};
use super::error::CommandError;
use super::interface::CameraInterface;
use super::session::{ActiveJob, CameraSession, SessionSnapshot};

/// The dispatcher loop: the sole executor of camera operations. It drains
/// the command queue one command at a time, so the queue itself is the lock
/// around the physical camera.
pub struct ControlTask {
    pub(super) interface: Box<dyn CameraInterface>,
    pub(super) cmd_rx: CameraCommandSource,
    pub(super) state_tx: watch::Sender<SessionSnapshot>,
    pub(super) session: CameraSession,
    pub(super) config: CameraConfig,
}

#[async_trait]
impl Task for ControlTask {
    fn name(&self) -> &'static str {
        "camera/control"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            mut interface,
            cmd_rx,
            state_tx,
            mut session,
            config,
        } = *self;

        let loop_fut = async {
            while let Ok((submission, ret)) = cmd_rx.recv_async().await {
                let Submission {
                    request,
                    origin,
                    cancel: cmd_cancel,
                } = submission;

                if cmd_cancel.is_cancelled() {
                    let _ = ret.send(Err(CommandError::Cancelled));
                    continue;
                }

                let kind = request.kind();

                // the session may have changed since the caller's pre-check
                if !session.can_accept(kind, origin) {
                    debug!(%kind, ?origin, state = %session.state(), "rejecting command");
                    let _ = ret.send(Err(session.rejection()));
                    continue;
                }

                let result =
                    execute(&mut *interface, &mut session, &state_tx, &config, request, origin)
                        .await;

                if let Err(err) = &result {
                    warn!(%kind, ?origin, %err, "command failed");
                }

                // publish before resolving, so a caller that sees its result
                // also sees the state that produced it
                publish(&state_tx, &session);
                let _ = ret.send(result);
            }

            Ok::<_, anyhow::Error>(())
        };

        select! {
            _ = cancel.cancelled() => {}
            res = loop_fut => { res? }
        }

        // teardown: stop active jobs and resolve whatever is still queued so
        // no caller is left waiting forever
        session.shutdown();
        while let Ok((_, ret)) = cmd_rx.try_recv() {
            let _ = ret.send(Err(CommandError::Cancelled));
        }

        info!("camera control task shut down");
        Ok(())
    }
}

fn publish(state_tx: &watch::Sender<SessionSnapshot>, session: &CameraSession) {
    let _ = state_tx.send(session.snapshot());
}

/// The driver-facing portion of a command, owned so it can outlive the
/// request it was built from.
enum DriverOp {
    Capture,
    SetSetting { key: String, value: String },
    Preview,
    Status,
}

async fn execute(
    interface: &mut dyn CameraInterface,
    session: &mut CameraSession,
    state_tx: &watch::Sender<SessionSnapshot>,
    config: &CameraConfig,
    request: CameraRequest,
    origin: Origin,
) -> Result<CameraResponse, CommandError> {
    match request {
        CameraRequest::Capture => {
            run_driver_op(
                interface,
                session,
                state_tx,
                config,
                CommandKind::Capture,
                DriverOp::Capture,
            )
            .await
        }
        CameraRequest::SetSetting { key, value } => {
            run_driver_op(
                interface,
                session,
                state_tx,
                config,
                CommandKind::SetSetting,
                DriverOp::SetSetting { key, value },
            )
            .await
        }
        CameraRequest::Preview => {
            run_driver_op(
                interface,
                session,
                state_tx,
                config,
                CommandKind::Preview,
                DriverOp::Preview,
            )
            .await
        }
        CameraRequest::Reconnect => {
            run_driver_op(
                interface,
                session,
                state_tx,
                config,
                CommandKind::Reconnect,
                DriverOp::Status,
            )
            .await
        }
        CameraRequest::StartTimelapse(job) => {
            let id = job.id();
            let params = job.params();
            session.timelapse_started(ActiveJob {
                id,
                cancel: job.cancel_token(),
            });
            info!(
                job = %id, ?origin,
                interval = ?params.interval, max_shots = ?params.max_shots,
                "starting timelapse"
            );
            tokio::spawn(job.run());
            Ok(CameraResponse::TimelapseStarted { job: id })
        }
        CameraRequest::StopTimelapse => {
            info!(?origin, "stopping timelapse");
            session.timelapse_stopped();
            Ok(CameraResponse::Unit)
        }
        CameraRequest::StartStream(job) => {
            let id = job.id();
            session.stream_started(ActiveJob {
                id,
                cancel: job.cancel_token(),
            });
            info!(job = %id, ?origin, "starting preview stream");
            tokio::spawn(job.run());
            Ok(CameraResponse::StreamStarted { job: id })
        }
        CameraRequest::StopStream => {
            info!(?origin, "stopping preview stream");
            session.stream_stopped();
            Ok(CameraResponse::Unit)
        }
    }
}

/// Execute one exclusive driver invocation: mark the session busy, apply
/// the per-attempt timeout and the busy-device retry policy, classify the
/// failure, and put the session back in order.
async fn run_driver_op(
    interface: &mut dyn CameraInterface,
    session: &mut CameraSession,
    state_tx: &watch::Sender<SessionSnapshot>,
    config: &CameraConfig,
    kind: CommandKind,
    op: DriverOp,
) -> Result<CameraResponse, CommandError> {
    session.begin(kind);
    publish(state_tx, session);

    let mut attempt = 0;
    let result = loop {
        let result = invoke(interface, &op, config).await;

        match &result {
            Err(err) if !err.is_fatal() && attempt < config.busy_retries => {
                attempt += 1;
                debug!(%kind, %err, attempt, "transient driver failure, retrying");
                time::sleep(config.busy_retry_delay).await;
            }
            _ => break result,
        }
    };

    match result {
        Ok(response) => {
            if kind == CommandKind::Reconnect {
                info!("camera reconnected");
                session.reconnected();
            } else {
                session.settle(None);
            }
            Ok(response)
        }
        Err(err) if err.is_fatal() => {
            let err = CommandError::Device(err.to_string());
            session.disconnect(err.clone());
            Err(err)
        }
        Err(err) => {
            let err = CommandError::OperationFailed(err.to_string());
            session.settle(Some(err.clone()));
            Err(err)
        }
    }
}

/// A single driver call under its timeout. Expiry counts as a transient
/// failure rather than hanging the dispatcher.
async fn invoke(
    interface: &mut dyn CameraInterface,
    op: &DriverOp,
    config: &CameraConfig,
) -> Result<CameraResponse, super::interface::DriverError> {
    use super::interface::DriverError;

    let call = async {
        match op {
            DriverOp::Capture => interface.capture().await.map(CameraResponse::Image),
            DriverOp::SetSetting { key, value } => interface
                .set_setting(key, value)
                .await
                .map(|_| CameraResponse::Unit),
            DriverOp::Preview => interface.preview_frame().await.map(CameraResponse::Frame),
            DriverOp::Status => {
                let status = interface.status().await?;
                if status.connected {
                    Ok(CameraResponse::Unit)
                } else {
                    Err(DriverError::transient("camera is still unreachable"))
                }
            }
        }
    };

    match time::timeout(config.command_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::transient("driver call timed out")),
    }
}
