use std::time::Duration;

use clap::Parser;
use futures::{AsyncWriteExt, FutureExt};
use rustyline_async::{Readline, ReadlineEvent, SharedWriter};
use tokio::select;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use gphoto_bot::camera::{
    CallerId, CameraClient, CameraRequest, CameraResponse, CommandError, TimelapseParams,
};

/// Console stand-in for the Discord command layer: every line is one
/// interaction submitted on behalf of the local operator.
#[derive(Parser, Debug)]
#[clap(setting(clap::AppSettings::NoBinaryName))]
#[clap(rename_all = "kebab-case")]
enum Commands {
    #[clap(subcommand)]
    Camera(CameraCliRequest),
    Exit,
}

#[derive(clap::Subcommand, Debug)]
enum CameraCliRequest {
    /// capture a single image
    Capture,

    /// grab one preview frame
    Preview,

    /// change a camera setting
    Set { key: String, value: String },

    /// print the current session state
    Status,

    /// bring the camera back after it was unplugged
    Reconnect,

    /// run a repeating capture job
    #[clap(subcommand)]
    Timelapse(TimelapseCliRequest),

    /// live preview stream
    #[clap(subcommand)]
    Stream(StreamCliRequest),
}

#[derive(clap::Subcommand, Debug)]
enum TimelapseCliRequest {
    Start {
        /// seconds between shots
        #[clap(short, long)]
        interval: f64,

        /// stop automatically after this many shots
        #[clap(short, long)]
        count: Option<u32>,
    },
    Stop,
}

#[derive(clap::Subcommand, Debug)]
enum StreamCliRequest {
    Start {
        /// seconds between frames
        #[clap(short, long, default_value_t = 0.5)]
        interval: f64,
    },
    Stop,
}

pub async fn run_interactive_cli(
    mut editor: Readline,
    mut stdout: SharedWriter,
    client: CameraClient,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        select! {
            _ = cancellation_token.cancelled() => {
                break;
            }
            result = editor.readline().fuse() => {
                match result {
                    Ok(ReadlineEvent::Line(line)) => {
                        stdout.write_all(format!("gpb> {}\n", line).as_bytes()).await?;

                        let request: Result<Commands, _> =
                            Parser::try_parse_from(line.split_ascii_whitespace());

                        let request = match request {
                            Ok(request) => request,
                            Err(err) => {
                                stdout.write_all(err.to_string().as_bytes()).await?;
                                continue;
                            },
                        };

                        editor.add_history_entry(line);

                        match request {
                            Commands::Camera(request) => {
                                run_camera_command(&client, request).await;
                            }

                            Commands::Exit => {
                                info!("exiting");
                                cancellation_token.cancel();
                            }
                        };
                    }
                    Ok(ReadlineEvent::Eof) | Ok(ReadlineEvent::Interrupted) => {
                        cancellation_token.cancel();
                        break;
                    }
                    Err(err) => {
                        error!("interactive error: {:#?}", err);
                        break;
                    }
                };
            }
        }
    }

    cancellation_token.cancel();

    Ok(())
}

async fn run_camera_command(client: &CameraClient, request: CameraCliRequest) {
    let caller = CallerId::CONSOLE;

    match request {
        CameraCliRequest::Capture => {
            report(client.command(CameraRequest::Capture, caller).await);
        }

        CameraCliRequest::Preview => {
            report(client.command(CameraRequest::Preview, caller).await);
        }

        CameraCliRequest::Set { key, value } => {
            report(
                client
                    .command(CameraRequest::SetSetting { key, value }, caller)
                    .await,
            );
        }

        CameraCliRequest::Status => {
            info!("{:?}", client.state());
        }

        CameraCliRequest::Reconnect => {
            report(client.command(CameraRequest::Reconnect, caller).await);
        }

        CameraCliRequest::Timelapse(TimelapseCliRequest::Start { interval, count }) => {
            let params = TimelapseParams {
                interval: Duration::from_secs_f64(interval),
                max_shots: count,
            };

            match client.start_timelapse(params, caller).await {
                Ok(handle) => {
                    info!("timelapse {} started", handle.id());

                    // report back when the job ends, however it ends
                    tokio::spawn(async move {
                        match handle.finished().await {
                            Some(outcome) => info!(
                                "timelapse finished after {} shots: {:?}",
                                outcome.shots_taken, outcome.reason
                            ),
                            None => warn!("timelapse ended without reporting an outcome"),
                        }
                    });
                }
                Err(err) => error!("{}", err),
            }
        }

        CameraCliRequest::Timelapse(TimelapseCliRequest::Stop) => {
            report(
                client
                    .stop_timelapse(caller)
                    .await
                    .map(|_| CameraResponse::Unit),
            );
        }

        CameraCliRequest::Stream(StreamCliRequest::Start { interval }) => {
            match client
                .start_stream(Duration::from_secs_f64(interval), caller)
                .await
            {
                Ok(handle) => {
                    info!("stream {} started", handle.id());

                    tokio::spawn(async move {
                        let mut frames = handle.into_frames();
                        let mut count = 0u64;

                        loop {
                            match frames.recv().await {
                                Ok(frame) => {
                                    count += 1;
                                    trace!("frame {} ({} bytes)", count, frame.data.len());
                                }
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }

                        info!("stream closed after {} frames", count);
                    });
                }
                Err(err) => error!("{}", err),
            }
        }

        CameraCliRequest::Stream(StreamCliRequest::Stop) => {
            report(
                client
                    .stop_stream(caller)
                    .await
                    .map(|_| CameraResponse::Unit),
            );
        }
    }
}

fn report(result: Result<CameraResponse, CommandError>) {
    match result {
        Ok(response) => info!("{:?}", response),
        Err(err) => error!("{}", err),
    }
}
