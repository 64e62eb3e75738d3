use anyhow::Context;
use clap::Parser;
use rustyline_async::{Readline, SharedWriter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use gphoto_bot::camera;
use gphoto_bot::client::Task;
use gphoto_bot::config::{CameraKind, GphotoBotConfig};

use crate::cli::interactive::run_interactive_cli;

#[macro_use]
extern crate tracing;

mod cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // setup colorful backtraces
    color_backtrace::install();

    // set up logging and interactive line editor
    let (editor, stdout) =
        Readline::new("gpb> ".into()).context("failed to create interactive editor")?;

    let mut targets = Targets::new();

    if let Ok(directives) = std::env::var("RUST_LOG") {
        for directive in directives.split(',') {
            if let Some((target, level)) = directive.split_once('=') {
                targets = targets.with_target(
                    target,
                    level.parse::<LevelFilter>().context("invalid log level")?,
                );
            } else {
                targets = targets.with_default(
                    directive
                        .parse::<LevelFilter>()
                        .context("invalid log level")?,
                );
            }
        }
    }

    let (writer, _guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::hourly("logs", "gphoto-bot"));

    tracing_subscriber::registry()
        // writer that outputs to console
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer({
                    let stdout = stdout.clone();
                    move || stdout.clone()
                })
                .with_filter(targets),
        )
        // writer that outputs to files
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(Targets::new().with_targets(vec![("gphoto_bot", LevelFilter::DEBUG)])),
        )
        .init();

    let main_args: cli::args::MainArgs = cli::args::MainArgs::parse();

    debug!("reading config from {:?}", &main_args.config);
    let config = GphotoBotConfig::read_from_path(main_args.config)
        .context("failed to read config file")?;

    run_tasks(config, editor, stdout).await
}

async fn run_tasks(
    config: GphotoBotConfig,
    editor: Readline,
    stdout: SharedWriter,
) -> anyhow::Result<()> {
    let cancellation_token = CancellationToken::new();

    ctrlc::set_handler({
        let cancellation_token = cancellation_token.clone();
        move || {
            info!("received interrupt, shutting down");
            cancellation_token.cancel();
        }
    })
    .expect("could not set ctrl+c handler");

    let interface: Box<dyn camera::CameraInterface> = match config.camera.kind {
        CameraKind::Dummy => Box::new(camera::DummyCamera::new(config.camera.dummy_latency)),
    };

    debug!("initializing camera control task");
    let (control_task, client) = camera::create_task(config.camera, interface)
        .context("failed to initialize camera control task")?;

    let tasks: Vec<Box<dyn Task>> = vec![Box::new(control_task)];

    let mut join_set = JoinSet::new();

    join_set.spawn(run_interactive_cli(
        editor,
        stdout,
        client,
        cancellation_token.clone(),
    ));

    for task in tasks {
        debug!("starting {} task", task.name());
        join_set.spawn(task.run(cancellation_token.clone()));
    }

    while let Some(res) = join_set.join_next().await {
        // if task panicked, then will be Some(Err)
        // if task terminated w/ error, then will be Some(Ok(Err))
        // need to propagate errors in both cases

        match res {
            Err(err) => {
                cancellation_token.cancel();
                return Err(err).context("task failed");
            }
            Ok(Err(err)) => {
                cancellation_token.cancel();
                return Err(err).context("task terminated with error");
            }
            _ => {
                info!("exited task");
            }
        }
    }

    Ok(())
}
