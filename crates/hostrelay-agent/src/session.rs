//! One authenticated client connection
//!
//! A session reads the handshake, leases an execution host and then relays
//! every channel the client opens to a channel of the same kind on the host
//! link. Frames are read in a single loop; per-channel relays run as separate
//! tasks so a stalled channel never holds up the others.

use crate::auth::{AuthOutcome, TokenAuthenticator};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::execution_host::{ExecutionHost, HostStatus};
use crate::supervisor::{HostLease, HostSupervisor};
use crate::transport::BoxedStream;
use hostrelay_proto::message::{self, ControlMessage, GoodbyeReason, Handshake, HandshakeReply};
use hostrelay_proto::{Channel, ChannelReceiver, ChannelSender, Frame, FrameCodec, Multiplexer, CONTROL_CHANNEL};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the handshake
    Authenticating,
    /// Relaying channels
    Active,
    /// Ending channels and flushing queued writes
    Draining,
    /// Done
    Closed,
}

/// Shared services every session needs
#[derive(Clone)]
pub struct SessionContext {
    /// Agent configuration
    pub config: Arc<AgentConfig>,
    /// Host registry
    pub supervisor: HostSupervisor,
    /// Token check
    pub authenticator: Arc<TokenAuthenticator>,
}

/// Reset reason for client channels whose host went away
const HOST_TERMINATED: &str = "host terminated";

/// Time the writer always gets to flush the goodbye, even after a slow drain
const GOODBYE_FLUSH: Duration = Duration::from_millis(250);

/// How the active phase ended
enum Ending {
    /// Drain, optionally telling the client why first
    Drain(Option<GoodbyeReason>),
    /// The link is unusable; close without flushing
    Broken,
}

/// A client session
pub struct Session {
    id: Uuid,
    peer: String,
    ctx: SessionContext,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Create a session for a freshly accepted connection
    pub fn new(peer: impl Into<String>, ctx: SessionContext) -> Self {
        let (state, _) = watch::channel(SessionState::Authenticating);
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            ctx,
            state,
        }
    }

    /// Session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Watch of the session state
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        debug!("Session {} -> {:?}", self.id, state);
        self.state.send_replace(state);
    }

    /// Drive the session until it closes; `shutdown` starts draining
    pub async fn run(self, stream: BoxedStream, shutdown: CancellationToken) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut codec = FrameCodec::new();

        let handshake = match self.read_handshake(&mut codec, &mut reader).await {
            Some(handshake) => handshake,
            None => {
                let reply = message::encode(&HandshakeReply::unauthorized())?;
                let _ = codec.write_frame(&mut writer, &Frame::data(CONTROL_CHANNEL, reply)).await;
                let _ = writer.shutdown().await;
                self.set_state(SessionState::Closed);
                return Err(AgentError::Unauthorized);
            }
        };

        let lease = match self.ctx.supervisor.acquire(&handshake.host_key).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Session {} could not get a host for '{}': {}", self.id, handshake.host_key, e);
                let goodbye = message::encode(&ControlMessage::Goodbye {
                    reason: GoodbyeReason::HostUnavailable,
                })?;
                let _ = codec.write_frame(&mut writer, &Frame::data(CONTROL_CHANNEL, goodbye)).await;
                let _ = writer.shutdown().await;
                self.set_state(SessionState::Closed);
                return Err(e);
            }
        };

        let welcome = HandshakeReply::Welcome {
            session_id: self.id,
            host_id: lease.host().id(),
            host_pid: lease.host().pid(),
            host_started_at_ms: lease.host().started_at_ms(),
        };
        let sent = match message::encode(&welcome) {
            Ok(payload) => codec.write_frame(&mut writer, &Frame::data(CONTROL_CHANNEL, payload)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!("Session {} lost its client before the welcome: {}", self.id, e);
            self.set_state(SessionState::Closed);
            lease.release().await;
            return Err(e.into());
        }

        info!(
            "Session {} from {} attached to host {} ('{}')",
            self.id, self.peer, lease.host().id(), handshake.host_key
        );
        self.set_state(SessionState::Active);

        let result = self.relay(codec, reader, writer, &lease, shutdown).await;

        lease.release().await;
        self.set_state(SessionState::Closed);
        info!("Session {} closed", self.id);
        result
    }

    /// Read and check the handshake; `None` for every kind of failure
    async fn read_handshake(
        &self,
        codec: &mut FrameCodec,
        reader: &mut ReadHalf<BoxedStream>,
    ) -> Option<Handshake> {
        let auth = &self.ctx.authenticator;
        let timeout = self.ctx.config.handshake_timeout;

        let frame = match tokio::time::timeout(timeout, codec.read_frame(reader)).await {
            Ok(Ok(Some(frame))) if frame.channel_id == CONTROL_CHANNEL => frame,
            Ok(Ok(Some(frame))) => {
                debug!("Session {} sent channel {} before the handshake", self.id, frame.channel_id);
                auth.reject();
                return None;
            }
            Ok(Ok(None)) => {
                debug!("Session {} closed before the handshake", self.id);
                auth.reject();
                return None;
            }
            Ok(Err(e)) => {
                debug!("Session {} sent a malformed handshake: {}", self.id, e);
                auth.reject();
                return None;
            }
            Err(_) => {
                debug!("Session {} handshake timed out", self.id);
                auth.reject();
                return None;
            }
        };

        let handshake: Handshake = match message::decode(&frame.payload) {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!("Session {} handshake did not decode: {}", self.id, e);
                auth.reject();
                return None;
            }
        };

        match auth.authenticate(&handshake.token) {
            AuthOutcome::Accepted => Some(handshake),
            AuthOutcome::Rejected => None,
        }
    }

    async fn relay(
        &self,
        mut codec: FrameCodec,
        mut reader: ReadHalf<BoxedStream>,
        writer: WriteHalf<BoxedStream>,
        lease: &HostLease,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let host = lease.host();
        let (mux, outbound) = Multiplexer::new();
        let link_down = CancellationToken::new();
        let mut writer_task = tokio::spawn(write_loop(self.id, writer, outbound, link_down.clone()));

        // Live relay pairs by host channel id; each task yields its host channel id
        let mut pairs: HashMap<u32, RelayPair> = HashMap::new();
        let mut relays: JoinSet<u32> = JoinSet::new();
        let mut violation = None;

        let ending = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ending::Drain(Some(GoodbyeReason::Shutdown)),
                _ = host.exited() => {
                    warn!("Session {}: host {} terminated", self.id, host.id());
                    break Ending::Drain(Some(GoodbyeReason::HostTerminated));
                }
                _ = link_down.cancelled() => break Ending::Broken,
                Some(done) = relays.join_next(), if !relays.is_empty() => {
                    if let Ok(host_channel) = done {
                        pairs.remove(&host_channel);
                    }
                }
                read = codec.read_frame(&mut reader) => match read {
                    Ok(Some(frame)) if frame.channel_id == CONTROL_CHANNEL => {
                        debug!("Session {} ignoring control frame", self.id);
                    }
                    Ok(Some(frame)) => match mux.route_frame(frame) {
                        Ok(Some(channel)) => {
                            if let Some((host_channel, pair)) = self.attach(channel, host, &mut relays) {
                                pairs.insert(host_channel, pair);
                            }
                        }
                        Ok(None) => {}
                        Err(e) if e.is_fatal() => {
                            warn!("Session {} violated the protocol: {}", self.id, e);
                            violation = Some(e);
                            break Ending::Drain(Some(GoodbyeReason::ProtocolViolation));
                        }
                        Err(e) => debug!("Session {} ignoring frame: {}", self.id, e),
                    },
                    Ok(None) => {
                        debug!("Session {} reached end of stream", self.id);
                        break Ending::Drain(None);
                    }
                    Err(hostrelay_proto::ProtocolError::Io(e)) => {
                        debug!("Session {} read failed: {}", self.id, e);
                        break Ending::Broken;
                    }
                    Err(e) => {
                        warn!("Session {} sent an unreadable frame: {}", self.id, e);
                        violation = Some(e);
                        break Ending::Drain(Some(GoodbyeReason::ProtocolViolation));
                    }
                },
            }
        };

        match ending {
            Ending::Drain(reason) => {
                self.set_state(SessionState::Draining);
                let grace = self.ctx.config.drain_grace;
                let deadline = Instant::now() + grace;

                // Nothing more is read from the client: relays pass on what is
                // queued, end the host side and wait for the host's replies
                mux.end_inbound_all();
                let drained = tokio::time::timeout_at(deadline, async {
                    while let Some(done) = relays.join_next().await {
                        if let Ok(host_channel) = done {
                            pairs.remove(&host_channel);
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    debug!("Session {} relays did not finish within {:?}", self.id, grace);
                    relays.shutdown().await;
                }

                let host_gone = matches!(reason, Some(GoodbyeReason::HostTerminated));
                for pair in pairs.values() {
                    let _ = pair.host.close();
                    if host_gone {
                        let _ = mux.reset_channel(pair.client_channel, HOST_TERMINATED);
                    }
                }
                mux.close_all();
                if let Some(reason) = reason {
                    debug!("Session {} closing: {}", self.id, reason);
                    if let Ok(payload) = message::encode(&ControlMessage::Goodbye { reason }) {
                        let _ = mux.send_frame(Frame::data(CONTROL_CHANNEL, payload));
                    }
                }
                drop(mux);

                let flush_until = deadline.max(Instant::now() + GOODBYE_FLUSH);
                if tokio::time::timeout_at(flush_until, &mut writer_task).await.is_err() {
                    debug!("Session {} did not flush within {:?}", self.id, grace);
                    writer_task.abort();
                }
            }
            Ending::Broken => {
                mux.abort_all();
                relays.shutdown().await;
                for pair in pairs.values() {
                    let _ = pair.host.close();
                }
                writer_task.abort();
            }
        }

        match violation {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Pair a client channel with a new host channel of the same kind
    fn attach(
        &self,
        channel: Channel,
        host: &Arc<ExecutionHost>,
        relays: &mut JoinSet<u32>,
    ) -> Option<(u32, RelayPair)> {
        let host_channel = match host.open_channel(channel.kind()) {
            Ok(host_channel) => host_channel,
            Err(e) => {
                debug!("Session {} could not open host channel: {}", self.id, e);
                let (client_tx, _) = channel.split();
                let _ = client_tx.reset(&format!("host unavailable: {}", e));
                return None;
            }
        };
        debug!(
            "Session {} channel {} ({}) -> host channel {}",
            self.id, channel.id(), channel.kind(), host_channel.id()
        );

        let host_channel_id = host_channel.id();
        let (client_tx, client_rx) = channel.split();
        let (host_tx, host_rx) = host_channel.split();
        let pair = RelayPair {
            client_channel: client_tx.id(),
            host: host_tx.clone(),
        };

        let to_host = pump_to_host(client_rx, host_tx);
        let to_client = pump_to_client(host_rx, client_tx, Arc::clone(host));
        relays.spawn(async move {
            tokio::join!(to_host, to_client);
            host_channel_id
        });
        Some((host_channel_id, pair))
    }
}

/// The two ends of one relayed channel
struct RelayPair {
    client_channel: u32,
    host: ChannelSender,
}

/// Copy messages until the source ends; false if the destination gave up
async fn forward(from: &mut ChannelReceiver, to: &ChannelSender) -> bool {
    while let Some(payload) = from.recv().await {
        if let Err(e) = to.send(payload).await {
            debug!("Relay {} -> {} stopped: {}", from.id(), to.id(), e);
            return false;
        }
    }
    true
}

async fn pump_to_host(mut from: ChannelReceiver, to: ChannelSender) {
    if forward(&mut from, &to).await {
        let _ = match from.error() {
            Some(reason) => to.reset(&reason),
            None => to.close(),
        };
    }
}

/// A host channel cut off by the host dying resets the client channel
/// instead of ending it
async fn pump_to_client(mut from: ChannelReceiver, to: ChannelSender, host: Arc<ExecutionHost>) {
    if !forward(&mut from, &to).await {
        return;
    }
    let reason = from.error().or_else(|| match host.status() {
        HostStatus::Running => None,
        HostStatus::Exited(_) => Some(HOST_TERMINATED.to_string()),
    });
    let _ = match reason {
        Some(reason) => to.reset(&reason),
        None => to.close(),
    };
}

async fn write_loop(
    session_id: Uuid,
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    link_down: CancellationToken,
) {
    let codec = FrameCodec::new();
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = codec.write_frame(&mut writer, &frame).await {
            debug!("Session {} write failed: {}", session_id, e);
            link_down.cancel();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionToken, DataDirs, HostCommand, TransportConfig};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn context(temp: &tempfile::TempDir) -> SessionContext {
        let token = ConnectionToken::new("good-token");
        let dirs = DataDirs::from_root(temp.path(), None);
        let command = HostCommand::new("/nonexistent/hostrelay-host", Vec::new());
        let config = AgentConfig::new(
            TransportConfig::Tcp { host: None, port: 0 },
            dirs.clone(),
            token.clone(),
            command.clone(),
        )
        .with_handshake_timeout(Duration::from_millis(200));

        SessionContext {
            config: Arc::new(config),
            supervisor: HostSupervisor::new(command, dirs, Duration::from_secs(60)),
            authenticator: Arc::new(TokenAuthenticator::new(&token)),
        }
    }

    fn start(ctx: SessionContext) -> (DuplexStream, watch::Receiver<SessionState>, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = Session::new("test", ctx);
        let state = session.state();
        let task = tokio::spawn(session.run(Box::new(server), CancellationToken::new()));
        (client, state, task)
    }

    async fn read_reply<T: serde::de::DeserializeOwned>(client: &mut DuplexStream) -> T {
        let mut codec = FrameCodec::new();
        let frame = codec.read_frame(client).await.unwrap().unwrap();
        assert_eq!(frame.channel_id, CONTROL_CHANNEL);
        message::decode(&frame.payload).unwrap()
    }

    async fn send_handshake(client: &mut DuplexStream, token: &str) {
        let payload = message::encode(&Handshake::new(token, "ws")).unwrap();
        FrameCodec::new()
            .write_frame(client, &Frame::data(CONTROL_CHANNEL, payload))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(&temp);
        let auth = Arc::clone(&ctx.authenticator);
        let (mut client, state, task) = start(ctx);

        send_handshake(&mut client, "bad-token").await;
        let reply: HandshakeReply = read_reply(&mut client).await;

        assert_eq!(reply, HandshakeReply::unauthorized());
        assert!(matches!(task.await.unwrap(), Err(AgentError::Unauthorized)));
        assert_eq!(*state.borrow(), SessionState::Closed);
        assert_eq!(auth.rejections(), 1);
    }

    #[tokio::test]
    async fn test_garbage_handshake_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let (mut client, _state, task) = start(context(&temp));

        FrameCodec::new()
            .write_frame(&mut client, &Frame::data(CONTROL_CHANNEL, bytes::Bytes::from_static(b"\xc1\xc1")))
            .await
            .unwrap();
        let reply: HandshakeReply = read_reply(&mut client).await;

        assert_eq!(reply, HandshakeReply::unauthorized());
        assert!(matches!(task.await.unwrap(), Err(AgentError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_channel_frame_before_handshake_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let (mut client, _state, task) = start(context(&temp));

        let open = message::encode(&hostrelay_proto::ChannelOpen::new("echo")).unwrap();
        FrameCodec::new().write_frame(&mut client, &Frame::open(1, open)).await.unwrap();
        let reply: HandshakeReply = read_reply(&mut client).await;

        assert_eq!(reply, HandshakeReply::unauthorized());
        assert!(matches!(task.await.unwrap(), Err(AgentError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let temp = tempfile::tempdir().unwrap();
        let (mut client, _state, task) = start(context(&temp));

        let reply: HandshakeReply = read_reply(&mut client).await;
        assert_eq!(reply, HandshakeReply::unauthorized());
        assert!(matches!(task.await.unwrap(), Err(AgentError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_unavailable_host_says_goodbye() {
        let temp = tempfile::tempdir().unwrap();
        let (mut client, state, task) = start(context(&temp));

        send_handshake(&mut client, "good-token").await;
        let goodbye: ControlMessage = read_reply(&mut client).await;

        assert_eq!(goodbye, ControlMessage::Goodbye { reason: GoodbyeReason::HostUnavailable });
        assert!(matches!(task.await.unwrap(), Err(AgentError::HostSpawn { .. })));
        assert_eq!(*state.borrow(), SessionState::Closed);
    }
}
