//! Session management and connection handling

use crate::{ClientError, Context, Result};
use hostrelay_proto::message::{self, ControlMessage, GoodbyeReason, Handshake, HandshakeReply};
use hostrelay_proto::{Channel, Frame, FrameCodec, Multiplexer, CONTROL_CHANNEL};

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Host key used when the builder is not given one
pub const DEFAULT_HOST_KEY: &str = "default";

/// How long [`ConnectedSession::close`] waits for queued frames to go out
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is attached and channels can be opened
    Active,
    /// The agent said goodbye or the connection dropped
    Closed(Option<GoodbyeReason>),
}

impl SessionStatus {
    /// Goodbye reason, if the agent sent one
    pub fn reason(&self) -> Option<GoodbyeReason> {
        match self {
            Self::Active | Self::Closed(None) => None,
            Self::Closed(Some(reason)) => Some(*reason),
        }
    }

    /// The error an operation on a session in this state fails with
    pub(crate) fn closed_error(&self) -> ClientError {
        match self.reason() {
            Some(reason) => ClientError::Closed(reason),
            None => ClientError::Disconnected,
        }
    }
}

/// What the agent told us when it accepted the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    /// Session ID assigned by the agent
    pub session_id: Uuid,
    /// Identity of the execution host instance
    pub host_id: Uuid,
    /// OS process ID of the execution host
    pub host_pid: Option<u32>,
    /// Spawn time of the execution host (unix millis)
    pub host_started_at_ms: u64,
}

/// Session builder for configuring connections
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    /// Connection token
    token: String,
    /// Host key selecting the execution host
    host_key: String,
    /// Connect and handshake timeout
    timeout: Duration,
}

impl SessionBuilder {
    /// Create a new session builder presenting `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            host_key: DEFAULT_HOST_KEY.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the host key
    pub fn with_host_key(mut self, host_key: impl Into<String>) -> Self {
        self.host_key = host_key.into();
        self
    }

    /// Set connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect to an agent listening on TCP
    pub async fn connect_tcp(self, addr: impl ToSocketAddrs) -> Result<ConnectedSession> {
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Connection(e.to_string())),
            Err(_) => return Err(ClientError::Timeout { duration: self.timeout }),
        };
        let _ = stream.set_nodelay(true);
        self.connect_stream(stream).await
    }

    /// Connect to an agent listening on a unix domain socket
    #[cfg(unix)]
    #[cfg_attr(docsrs, doc(cfg(unix)))]
    pub async fn connect_local(self, path: impl AsRef<std::path::Path>) -> Result<ConnectedSession> {
        let path = path.as_ref();
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| ClientError::Connection(format!("{}: {}", path.display(), e)))?;
        self.connect_stream(stream).await
    }

    /// Connect to an agent listening on a named pipe
    #[cfg(windows)]
    #[cfg_attr(docsrs, doc(cfg(windows)))]
    pub async fn connect_local(self, path: impl AsRef<std::path::Path>) -> Result<ConnectedSession> {
        let path = path.as_ref();
        let stream = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(path)
            .map_err(|e| ClientError::Connection(format!("{}: {}", path.display(), e)))?;
        self.connect_stream(stream).await
    }

    /// Perform the handshake over an already connected stream
    pub async fn connect_stream<S>(self, stream: S) -> Result<ConnectedSession>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        debug!("Connecting with host key '{}'", self.host_key);

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut codec = FrameCodec::new();

        let handshake = message::encode(&Handshake::new(self.token, self.host_key))?;
        codec.write_frame(&mut writer, &Frame::data(CONTROL_CHANNEL, handshake)).await?;

        let welcome = match tokio::time::timeout(self.timeout, read_reply(&mut codec, &mut reader)).await {
            Ok(reply) => reply?,
            Err(_) => return Err(ClientError::Timeout { duration: self.timeout }),
        };

        info!(
            "Session {} attached to host {} (pid {:?})",
            welcome.session_id, welcome.host_id, welcome.host_pid
        );
        Ok(ConnectedSession::start(welcome, codec, reader, writer))
    }
}

/// Read the agent's answer to our handshake
async fn read_reply<R>(codec: &mut FrameCodec, reader: &mut R) -> Result<Welcome>
where
    R: AsyncRead + Unpin,
{
    let frame = codec.read_frame(reader).await?.ok_or(ClientError::Disconnected)?;
    if frame.channel_id != CONTROL_CHANNEL {
        return Err(ClientError::UnexpectedReply(format!(
            "frame on channel {} before the handshake reply",
            frame.channel_id
        )));
    }

    if let Ok(reply) = message::decode::<HandshakeReply>(&frame.payload) {
        return match reply {
            HandshakeReply::Welcome { session_id, host_id, host_pid, host_started_at_ms } => Ok(Welcome {
                session_id,
                host_id,
                host_pid,
                host_started_at_ms,
            }),
            HandshakeReply::Rejected { reason } => {
                debug!("Handshake rejected: {}", reason);
                Err(ClientError::Unauthorized)
            }
        };
    }

    match message::decode::<ControlMessage>(&frame.payload)? {
        ControlMessage::Goodbye { reason } => Err(ClientError::Closed(reason)),
    }
}

/// An authenticated session attached to an execution host
pub struct ConnectedSession {
    /// Handshake outcome
    welcome: Welcome,
    /// Channel table of this link
    mux: Multiplexer,
    /// Current session status
    status: watch::Receiver<SessionStatus>,
    /// Tells the writer to flush and stop
    stop: Option<oneshot::Sender<()>>,
    /// Inbound frame loop
    reader_task: JoinHandle<()>,
    /// Outbound frame loop
    writer_task: Option<JoinHandle<()>>,
}

impl ConnectedSession {
    fn start<S>(welcome: Welcome, codec: FrameCodec, reader: ReadHalf<S>, writer: WriteHalf<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mux, outbound) = Multiplexer::new();
        let (status_tx, status) = watch::channel(SessionStatus::Active);
        let (stop, stop_rx) = oneshot::channel();

        let writer_task = tokio::spawn(write_loop(writer, outbound, stop_rx));
        let reader_task = tokio::spawn(read_loop(codec, reader, mux.clone(), status_tx));

        Self {
            welcome,
            mux,
            status,
            stop: Some(stop),
            reader_task,
            writer_task: Some(writer_task),
        }
    }

    /// Handshake outcome
    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    /// Session ID assigned by the agent
    pub fn session_id(&self) -> Uuid {
        self.welcome.session_id
    }

    /// Identity of the execution host serving this session
    pub fn host_id(&self) -> Uuid {
        self.welcome.host_id
    }

    /// OS process ID of the execution host
    pub fn host_pid(&self) -> Option<u32> {
        self.welcome.host_pid
    }

    /// Spawn time of the execution host (unix millis)
    pub fn host_started_at_ms(&self) -> u64 {
        self.welcome.host_started_at_ms
    }

    /// Current session status
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Goodbye reason, once the agent sent one
    pub fn goodbye(&self) -> Option<GoodbyeReason> {
        self.status().reason()
    }

    /// Open a channel of the given kind on the execution host
    pub fn open_channel(&self, kind: &str) -> Result<Channel> {
        let status = self.status();
        if status != SessionStatus::Active {
            return Err(status.closed_error());
        }
        Ok(self.mux.open_channel(kind)?)
    }

    /// Number of open channels
    pub fn channel_count(&self) -> usize {
        self.mux.channel_count()
    }

    /// Typed operations over this session
    pub fn context(&self) -> Context {
        Context::new(self.welcome.session_id, self.mux.clone(), self.status.clone())
    }

    /// Wait until the session ends; returns the goodbye reason if one was sent
    pub async fn closed(&self) -> Option<GoodbyeReason> {
        let mut status = self.status.clone();
        // The reader publishes a closed status before dropping the sender
        let _ = status.wait_for(|s| *s != SessionStatus::Active).await;
        let reason = status.borrow().reason();
        reason
    }

    /// End every channel and close the connection
    pub async fn close(mut self) {
        debug!("Closing session {}", self.welcome.session_id);
        self.mux.close_all();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(mut writer_task) = self.writer_task.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer_task).await.is_err() {
                writer_task.abort();
            }
        }
        self.reader_task.abort();
    }
}

impl Drop for ConnectedSession {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for ConnectedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSession")
            .field("welcome", &self.welcome)
            .field("status", &self.status())
            .field("channels", &self.mux.channel_count())
            .finish()
    }
}

async fn read_loop<R>(
    mut codec: FrameCodec,
    mut reader: R,
    mux: Multiplexer,
    status: watch::Sender<SessionStatus>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match codec.read_frame(&mut reader).await {
            Ok(Some(frame)) if frame.channel_id == CONTROL_CHANNEL => {
                match message::decode::<ControlMessage>(&frame.payload) {
                    Ok(ControlMessage::Goodbye { reason }) => {
                        info!("Agent said goodbye: {}", reason);
                        status.send_replace(SessionStatus::Closed(Some(reason)));
                    }
                    Err(e) => warn!("Ignoring control payload: {}", e),
                }
            }
            Ok(Some(frame)) => match mux.route_frame(frame) {
                Ok(Some(channel)) => {
                    warn!("Agent opened channel {} ({}); refusing", channel.id(), channel.kind());
                    let (sender, _) = channel.split();
                    let _ = sender.reset("clients do not accept channels");
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!("Agent violated the protocol: {}", e);
                    break;
                }
                Err(e) => debug!("Ignoring frame: {}", e),
            },
            Ok(None) => {
                debug!("Agent closed the connection");
                break;
            }
            Err(e) => {
                warn!("Error reading frame: {}", e);
                break;
            }
        }
    }

    mux.abort_all();
    status.send_if_modified(|current| {
        if *current == SessionStatus::Active {
            *current = SessionStatus::Closed(None);
            true
        } else {
            false
        }
    });
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut stop: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    let codec = FrameCodec::new();
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = &mut stop => {
                // Flush what is already queued, then stop
                while let Ok(frame) = outbound.try_recv() {
                    if codec.write_frame(&mut writer, &frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        };
        if let Err(e) = codec.write_frame(&mut writer, &frame).await {
            debug!("Error writing frame: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
