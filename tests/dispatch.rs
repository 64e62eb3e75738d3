use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;
use tokio_util::sync::CancellationToken;

use gphoto_bot::camera::{
    self, CallerId, CameraClient, CameraInterface, CameraRequest, CameraStatus, CommandError,
    DriverError, Frame, ImageHandle, SessionState, TimelapseEndReason, TimelapseParams,
};
use gphoto_bot::client::Task;
use gphoto_bot::config::CameraConfig;

#[derive(Default)]
struct Counters {
    captures: AtomicU32,
    previews: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl Counters {
    fn enter(&self) {
        let n = self.in_flight.fetch_add(1, SeqCst) + 1;
        self.max_in_flight.fetch_max(n, SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, SeqCst);
    }
}

/// Driver adapter with scriptable capture failures. A fatal scripted error
/// also flips the simulated camera to unreachable, like a real unplug.
struct ScriptedCamera {
    latency: Duration,
    counters: Arc<Counters>,
    capture_script: Arc<Mutex<VecDeque<DriverError>>>,
    connected: Arc<AtomicBool>,
    hang_captures: Arc<AtomicBool>,
}

impl ScriptedCamera {
    fn new(latency: Duration) -> Self {
        ScriptedCamera {
            latency,
            counters: Arc::new(Counters::default()),
            capture_script: Arc::new(Mutex::new(VecDeque::new())),
            connected: Arc::new(AtomicBool::new(true)),
            hang_captures: Arc::new(AtomicBool::new(false)),
        }
    }

    fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    fn connected_handle(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    fn script_capture_failures(&self, errors: Vec<DriverError>) {
        self.capture_script.lock().unwrap().extend(errors);
    }

    fn hang_handle(&self) -> Arc<AtomicBool> {
        self.hang_captures.clone()
    }
}

#[async_trait]
impl CameraInterface for ScriptedCamera {
    async fn capture(&mut self) -> Result<ImageHandle, DriverError> {
        while self.hang_captures.load(SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        self.counters.enter();
        tokio::time::sleep(self.latency).await;
        self.counters.leave();

        if let Some(err) = self.capture_script.lock().unwrap().pop_front() {
            if err.is_fatal() {
                self.connected.store(false, SeqCst);
            }
            return Err(err);
        }

        if !self.connected.load(SeqCst) {
            return Err(DriverError::fatal("camera unplugged"));
        }

        self.counters.captures.fetch_add(1, SeqCst);
        Ok(ImageHandle {
            name: "img.jpg".into(),
            captured_at: Local::now(),
        })
    }

    async fn set_setting(&mut self, _key: &str, _value: &str) -> Result<(), DriverError> {
        self.counters.enter();
        tokio::time::sleep(self.latency).await;
        self.counters.leave();
        Ok(())
    }

    async fn preview_frame(&mut self) -> Result<Frame, DriverError> {
        self.counters.enter();
        tokio::time::sleep(self.latency).await;
        self.counters.leave();

        self.counters.previews.fetch_add(1, SeqCst);
        Ok(Frame {
            data: Bytes::from_static(&[0xff, 0xd8, 0xff, 0xd9]),
            captured_at: Local::now(),
        })
    }

    async fn status(&mut self) -> Result<CameraStatus, DriverError> {
        Ok(CameraStatus {
            connected: self.connected.load(SeqCst),
        })
    }
}

fn test_config() -> CameraConfig {
    CameraConfig {
        busy_retries: 0,
        command_timeout: Duration::from_secs(5),
        ..CameraConfig::default()
    }
}

fn spawn_controller(
    camera: ScriptedCamera,
    config: CameraConfig,
) -> (CameraClient, CancellationToken) {
    let cancel = CancellationToken::new();
    let (task, client) = camera::create_task(config, Box::new(camera)).expect("create_task");
    let task: Box<dyn Task> = Box::new(task);
    tokio::spawn(task.run(cancel.clone()));
    (client, cancel)
}

#[tokio::test(start_paused = true)]
async fn commands_execute_one_at_a_time() {
    let camera = ScriptedCamera::new(Duration::from_millis(100));
    let counters = camera.counters();
    let (client, _cancel) = spawn_controller(camera, test_config());

    let mut tickets = Vec::new();
    for _ in 0..8 {
        tickets.push(
            client
                .submit(CameraRequest::Capture, CallerId(1))
                .expect("queued while idle"),
        );
    }

    for ticket in tickets {
        ticket.wait().await.expect("capture result");
    }

    assert_eq!(counters.captures.load(SeqCst), 8);
    assert_eq!(counters.max_in_flight.load(SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn queue_shutdown_resolves_pending_commands() {
    let camera = ScriptedCamera::new(Duration::from_millis(200));
    let (client, cancel) = spawn_controller(camera, test_config());

    let tickets: Vec<_> = (0..4)
        .map(|_| {
            client
                .submit(CameraRequest::Capture, CallerId(1))
                .expect("queued while idle")
        })
        .collect();

    cancel.cancel();

    for ticket in tickets {
        let result = tokio::time::timeout(Duration::from_secs(1), ticket.wait())
            .await
            .expect("every sink resolves after shutdown");
        match result {
            Ok(_) | Err(CommandError::Cancelled) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn overlapping_timelapse_is_rejected() {
    let camera = ScriptedCamera::new(Duration::from_millis(10));
    let (client, _cancel) = spawn_controller(camera, test_config());

    let params = TimelapseParams {
        interval: Duration::from_secs(60),
        max_shots: None,
    };

    let _handle = client
        .start_timelapse(params, CallerId(1))
        .await
        .expect("first timelapse starts");

    let err = client
        .start_timelapse(params, CallerId(2))
        .await
        .expect_err("second timelapse must be rejected");
    assert!(matches!(
        err,
        CommandError::InvalidState {
            state: SessionState::TimelapseRunning
        }
    ));

    client.stop_timelapse(CallerId(1)).await.expect("stop");
    assert_eq!(client.state().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn timelapse_runs_to_max_shots() {
    let camera = ScriptedCamera::new(Duration::from_millis(10));
    let counters = camera.counters();
    let (client, _cancel) = spawn_controller(camera, test_config());

    let handle = client
        .start_timelapse(
            TimelapseParams {
                interval: Duration::from_secs(1),
                max_shots: Some(3),
            },
            CallerId(7),
        )
        .await
        .expect("start");

    let outcome = handle.finished().await.expect("outcome");
    assert_eq!(outcome.shots_taken, 3);
    assert_eq!(outcome.reason, TimelapseEndReason::Completed);
    assert_eq!(counters.captures.load(SeqCst), 3);
    assert_eq!(client.state().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn timelapse_stops_after_three_consecutive_failures() {
    let camera = ScriptedCamera::new(Duration::from_millis(10));
    let counters = camera.counters();
    camera.script_capture_failures(vec![DriverError::transient("usb busy"); 3]);
    let (client, _cancel) = spawn_controller(camera, test_config());

    let handle = client
        .start_timelapse(
            TimelapseParams {
                interval: Duration::from_secs(1),
                max_shots: None,
            },
            CallerId(3),
        )
        .await
        .expect("start");

    let outcome = handle.finished().await.expect("outcome");
    assert_eq!(outcome.shots_taken, 0);
    assert!(matches!(
        outcome.reason,
        TimelapseEndReason::Failed(CommandError::OperationFailed(_))
    ));
    assert_eq!(client.state().state, SessionState::Idle);

    // the dispatcher survived; a fresh capture goes through
    client
        .command(CameraRequest::Capture, CallerId(3))
        .await
        .expect("capture after failed timelapse");
    assert_eq!(counters.captures.load(SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_capture_failure_ends_timelapse_and_disconnects() {
    let camera = ScriptedCamera::new(Duration::from_millis(10));
    camera.script_capture_failures(vec![DriverError::fatal("device not found")]);
    let (client, _cancel) = spawn_controller(camera, test_config());

    let handle = client
        .start_timelapse(
            TimelapseParams {
                interval: Duration::from_secs(1),
                max_shots: None,
            },
            CallerId(4),
        )
        .await
        .expect("start");

    let outcome = handle.finished().await.expect("outcome");
    assert_eq!(outcome.shots_taken, 0);
    assert!(matches!(
        outcome.reason,
        TimelapseEndReason::Failed(CommandError::Device(_))
    ));
    assert_eq!(client.state().state, SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_and_reconnect_flow() {
    let camera = ScriptedCamera::new(Duration::from_millis(10));
    let counters = camera.counters();
    let connected = camera.connected_handle();
    camera.script_capture_failures(vec![DriverError::fatal("device not found")]);
    let (client, _cancel) = spawn_controller(camera, test_config());

    let err = client
        .command(CameraRequest::Capture, CallerId(1))
        .await
        .expect_err("fatal failure");
    assert!(matches!(err, CommandError::Device(_)));
    assert_eq!(client.state().state, SessionState::Disconnected);

    // rejected client-side; never enters the queue
    let err = client
        .submit(CameraRequest::Capture, CallerId(1))
        .expect_err("rejected immediately");
    assert!(matches!(
        err,
        CommandError::InvalidState {
            state: SessionState::Disconnected
        }
    ));

    // camera still unreachable: reconnect fails, session stays down
    let err = client
        .command(CameraRequest::Reconnect, CallerId(1))
        .await
        .expect_err("still unreachable");
    assert!(matches!(err, CommandError::OperationFailed(_)));
    assert_eq!(client.state().state, SessionState::Disconnected);

    connected.store(true, SeqCst);
    client
        .command(CameraRequest::Reconnect, CallerId(1))
        .await
        .expect("reconnect");
    assert_eq!(client.state().state, SessionState::Idle);
    assert_eq!(counters.captures.load(SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_in_place() {
    let camera = ScriptedCamera::new(Duration::from_millis(10));
    let counters = camera.counters();
    camera.script_capture_failures(vec![DriverError::transient("usb busy"); 2]);
    let (client, _cancel) = spawn_controller(
        camera,
        CameraConfig {
            busy_retries: 2,
            ..test_config()
        },
    );

    // two scripted failures are absorbed by the retry budget
    client
        .command(CameraRequest::Capture, CallerId(1))
        .await
        .expect("capture succeeds after retries");
    assert_eq!(counters.captures.load(SeqCst), 1);
    assert_eq!(client.state().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_resolve_as_operation_failed() {
    let camera = ScriptedCamera::new(Duration::from_millis(10));
    let counters = camera.counters();
    camera.script_capture_failures(vec![DriverError::transient("usb busy"); 3]);
    let (client, _cancel) = spawn_controller(
        camera,
        CameraConfig {
            busy_retries: 2,
            ..test_config()
        },
    );

    // first attempt plus two retries, all failing
    let err = client
        .command(CameraRequest::Capture, CallerId(1))
        .await
        .expect_err("retry budget exhausted");
    assert!(matches!(err, CommandError::OperationFailed(_)));
    assert_eq!(counters.captures.load(SeqCst), 0);
    assert_eq!(client.state().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn hung_driver_call_times_out_as_transient() {
    let camera = ScriptedCamera::new(Duration::from_millis(10));
    let counters = camera.counters();
    let hang = camera.hang_handle();
    hang.store(true, SeqCst);
    let (client, _cancel) = spawn_controller(camera, test_config());

    let err = client
        .command(CameraRequest::Capture, CallerId(1))
        .await
        .expect_err("hung capture times out");
    assert!(matches!(err, CommandError::OperationFailed(_)));
    assert_eq!(client.state().state, SessionState::Idle);

    // the timeout was contained to that command; the camera still works
    hang.store(false, SeqCst);
    client
        .command(CameraRequest::Capture, CallerId(1))
        .await
        .expect("capture after timeout");
    assert_eq!(counters.captures.load(SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_queued_command_is_never_dispatched() {
    let camera = ScriptedCamera::new(Duration::from_millis(100));
    let counters = camera.counters();
    let (client, _cancel) = spawn_controller(camera, test_config());

    let first = client
        .submit(CameraRequest::Capture, CallerId(1))
        .expect("queued");
    let second = client
        .submit(CameraRequest::Capture, CallerId(2))
        .expect("queued");
    second.cancel();

    first.wait().await.expect("first capture");
    assert_eq!(
        second.wait().await.expect_err("withdrawn"),
        CommandError::Cancelled
    );
    assert_eq!(counters.captures.load(SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn preview_stream_start_and_stop() {
    let camera = ScriptedCamera::new(Duration::from_millis(5));
    let counters = camera.counters();
    let (client, _cancel) = spawn_controller(camera, test_config());

    let handle = client
        .start_stream(Duration::from_millis(50), CallerId(9))
        .await
        .expect("stream starts");
    assert_eq!(client.state().state, SessionState::Streaming);

    let mut frames = handle.into_frames();
    for _ in 0..2 {
        frames.recv().await.expect("frame");
    }

    // one-shots are refused while the stream owns the camera
    let err = client
        .submit(CameraRequest::Capture, CallerId(9))
        .expect_err("busy streaming");
    assert!(matches!(
        err,
        CommandError::InvalidState {
            state: SessionState::Streaming
        }
    ));

    client.stop_stream(CallerId(9)).await.expect("stop");
    assert_eq!(client.state().state, SessionState::Idle);
    assert!(counters.previews.load(SeqCst) >= 2);
}
