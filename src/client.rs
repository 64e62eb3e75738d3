use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A long-running unit of the system. Tasks are spawned at startup and run
/// until the cancellation token fires.
#[async_trait]
pub trait Task: Send {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// A request paired with the single-use channel its result is delivered on.
/// The receiving task must resolve the sender exactly once; dropping it
/// unresolved is surfaced to the caller as cancellation.
pub type Command<Req, Res, Err> = (Req, oneshot::Sender<Result<Res, Err>>);

pub type ChannelCommandSink<Req, Res, Err> = flume::Sender<Command<Req, Res, Err>>;
pub type ChannelCommandSource<Req, Res, Err> = flume::Receiver<Command<Req, Res, Err>>;
