//! Execution host main loop
//!
//! Runs inside `hostrelay-host`: reads frames from stdin, writes frames to
//! stdout and hands every channel the agent opens to the handler registered
//! for its kind.

use anyhow::{Context, Result};
use hostrelay_proto::{Channel, FrameCodec, Multiplexer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{stdin, stdout, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long queued frames may take to flush once input ends
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Serves one channel kind
#[async_trait::async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Serve `channel` until the peer ends it or the exchange is complete
    ///
    /// The channel is closed after a successful return and reset with the
    /// error text after a failure.
    async fn serve(&self, channel: &mut Channel) -> Result<()>;
}

/// Frame loop of an execution host
pub struct WorkerLoop<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Input stream (typically stdin)
    reader: R,
    /// Output stream (typically stdout)
    writer: Option<W>,
    /// Registered handlers by channel kind
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandler>>>>,
    /// Shutdown signal receiver
    shutdown_rx: Option<oneshot::Receiver<()>>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl WorkerLoop<tokio::io::Stdin, tokio::io::Stdout> {
    /// Create a worker loop over stdin/stdout
    pub fn new() -> Self {
        Self::with_io(stdin(), stdout())
    }
}

impl Default for WorkerLoop<tokio::io::Stdin, tokio::io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> WorkerLoop<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a worker loop with custom reader/writer
    pub fn with_io(reader: R, writer: W) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            reader,
            writer: Some(writer),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Register the handler for a channel kind
    pub async fn register_handler(&self, kind: &str, handler: Arc<dyn ChannelHandler>) {
        let mut handlers = self.handlers.write().await;
        debug!("Registered handler for channel kind: {}", kind);
        handlers.insert(kind.to_string(), handler);
    }

    /// Get shutdown sender for graceful shutdown
    pub fn shutdown_sender(&mut self) -> Option<oneshot::Sender<()>> {
        self.shutdown_tx.take()
    }

    /// Run until the input ends or shutdown is signalled
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting worker loop");

        let mut shutdown_rx = self.shutdown_rx.take().context("Worker loop already ran")?;
        let mut writer = self.writer.take().context("Worker loop already ran")?;

        let (mux, mut outbound) = Multiplexer::new();
        let mut writer_task = tokio::spawn(async move {
            let codec = FrameCodec::new();
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = codec.write_frame(&mut writer, &frame).await {
                    error!("Error writing frame: {}", e);
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut codec = FrameCodec::new();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Received shutdown signal, stopping worker loop");
                    break;
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                read = codec.read_frame(&mut self.reader) => match read {
                    Ok(Some(frame)) => match mux.route_frame(frame) {
                        Ok(Some(channel)) => Self::dispatch(&self.handlers, channel, &mut tasks).await,
                        Ok(None) => {}
                        Err(e) if e.is_fatal() => {
                            error!("Agent link violated the protocol: {}", e);
                            break;
                        }
                        Err(e) => debug!("Ignoring frame: {}", e),
                    },
                    Ok(None) => {
                        info!("Input stream closed, stopping worker loop");
                        break;
                    }
                    Err(e) => {
                        error!("Error reading frame: {}", e);
                        break;
                    }
                },
            }
        }

        tasks.shutdown().await;
        mux.close_all();
        drop(mux);
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task).await.is_err() {
            writer_task.abort();
        }

        info!("Worker loop stopped");
        Ok(())
    }

    async fn dispatch(
        handlers: &RwLock<HashMap<String, Arc<dyn ChannelHandler>>>,
        mut channel: Channel,
        tasks: &mut JoinSet<()>,
    ) {
        let handler = {
            let handlers = handlers.read().await;
            handlers.get(channel.kind()).cloned()
        };

        let Some(handler) = handler else {
            warn!("No handler for channel kind '{}'", channel.kind());
            let reason = format!("unsupported channel kind: {}", channel.kind());
            let (sender, _) = channel.split();
            let _ = sender.reset(&reason);
            return;
        };

        tasks.spawn(async move {
            let id = channel.id();
            match handler.serve(&mut channel).await {
                Ok(()) => {
                    let _ = channel.close();
                }
                Err(e) => {
                    error!("Handler for channel {} ({}) failed: {:#}", id, channel.kind(), e);
                    let (sender, _) = channel.split();
                    let _ = sender.reset(&format!("{:#}", e));
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hostrelay_proto::{ChannelOpen, Frame};
    use tokio::io::{duplex, DuplexStream};

    struct Upper;

    #[async_trait::async_trait]
    impl ChannelHandler for Upper {
        async fn serve(&self, channel: &mut Channel) -> Result<()> {
            while let Some(msg) = channel.recv().await {
                channel.send(Bytes::from(msg.to_ascii_uppercase())).await?;
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl ChannelHandler for Failing {
        async fn serve(&self, _channel: &mut Channel) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    async fn start() -> (DuplexStream, DuplexStream, tokio::task::JoinHandle<()>) {
        let (agent_out, worker_in) = duplex(64 * 1024);
        let (worker_out, agent_in) = duplex(64 * 1024);

        let mut worker = WorkerLoop::with_io(worker_in, worker_out);
        worker.register_handler("upper", Arc::new(Upper)).await;
        worker.register_handler("failing", Arc::new(Failing)).await;
        let task = tokio::spawn(async move {
            worker.run().await.unwrap();
        });
        (agent_out, agent_in, task)
    }

    async fn send(stream: &mut DuplexStream, frame: Frame) {
        FrameCodec::new().write_frame(stream, &frame).await.unwrap();
    }

    fn open(id: u32, kind: &str) -> Frame {
        Frame::open(id, hostrelay_proto::message::encode(&ChannelOpen::new(kind)).unwrap())
    }

    /// Next frame that is not a window update
    async fn next(codec: &mut FrameCodec, stream: &mut DuplexStream) -> Frame {
        loop {
            let frame = codec.read_frame(stream).await.unwrap().unwrap();
            if frame.window_delta().is_none() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_kind() {
        let (mut to_worker, mut from_worker, task) = start().await;
        let mut codec = FrameCodec::new();

        send(&mut to_worker, open(1, "upper")).await;
        send(&mut to_worker, Frame::data(1, Bytes::from("abc"))).await;

        let reply = next(&mut codec, &mut from_worker).await;
        assert_eq!(reply.channel_id, 1);
        assert_eq!(&reply.payload[..], b"ABC");

        send(&mut to_worker, Frame::end_stream(1)).await;
        let end = next(&mut codec, &mut from_worker).await;
        assert!(end.is_end_stream());

        drop(to_worker);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_kind_gets_error_frame() {
        let (mut to_worker, mut from_worker, task) = start().await;
        let mut codec = FrameCodec::new();

        send(&mut to_worker, open(3, "nope")).await;
        let reply = next(&mut codec, &mut from_worker).await;

        assert_eq!(reply.channel_id, 3);
        assert!(reply.is_error());
        assert!(reply.error_reason().contains("nope"));

        drop(to_worker);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_resets_channel() {
        let (mut to_worker, mut from_worker, task) = start().await;
        let mut codec = FrameCodec::new();

        send(&mut to_worker, open(5, "failing")).await;
        let reply = next(&mut codec, &mut from_worker).await;

        assert!(reply.is_error());
        assert_eq!(reply.error_reason(), "boom");

        drop(to_worker);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (agent_out, worker_in) = duplex(1024);
        let (worker_out, _agent_in) = duplex(1024);
        let mut worker = WorkerLoop::with_io(worker_in, worker_out);
        let stop = worker.shutdown_sender().unwrap();

        let task = tokio::spawn(async move { worker.run().await });
        stop.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        drop(agent_out);
    }
}
