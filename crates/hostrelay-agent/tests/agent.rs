//! End-to-end tests: an in-process agent serving real `hostrelay-host` workers

use bytes::Bytes;
use hostrelay::proto::message::{self, ChannelOpen, ControlMessage, GoodbyeReason, Handshake, HandshakeReply};
use hostrelay::proto::{Frame, FrameCodec, CONTROL_CHANNEL};
use hostrelay::{ClientError, ConnectedSession, SessionBuilder};
use hostrelay_agent::transport::ListenAddr;
use hostrelay_agent::{
    AgentConfig, AgentServer, ConnectionToken, DataDirs, HostCommand, HostSupervisor, ShutdownHandle,
    TransportConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const TOKEN: &str = "integration-token";
const WAIT: Duration = Duration::from_secs(10);

struct TestAgent {
    addr: ListenAddr,
    handle: ShutdownHandle,
    supervisor: HostSupervisor,
    task: JoinHandle<hostrelay_agent::Result<()>>,
    _dir: TempDir,
}

impl TestAgent {
    async fn start(host_grace: Duration) -> Self {
        Self::start_on(None, host_grace).await
    }

    async fn start_on(socket: Option<&str>, host_grace: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let transport = match socket {
            Some(name) => TransportConfig::Local { path: dir.path().join(name) },
            None => TransportConfig::Tcp { host: Some("127.0.0.1".to_string()), port: 0 },
        };
        let config = AgentConfig::new(
            transport,
            DataDirs::from_root(dir.path().join("agent"), None),
            ConnectionToken::new(TOKEN),
            HostCommand::new(env!("CARGO_BIN_EXE_hostrelay-host"), Vec::new()),
        )
        .with_host_grace(host_grace)
        .with_drain_grace(Duration::from_secs(2));

        let server = AgentServer::bind(config).await.unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let supervisor = server.supervisor().clone();
        let task = tokio::spawn(server.run());

        Self { addr, handle, supervisor, task, _dir: dir }
    }

    fn tcp_addr(&self) -> SocketAddr {
        match &self.addr {
            ListenAddr::Tcp(addr) => *addr,
            other => panic!("not a tcp agent: {}", other),
        }
    }

    fn socket_path(&self) -> PathBuf {
        match &self.addr {
            ListenAddr::Local(path) => path.clone(),
            other => panic!("not a local agent: {}", other),
        }
    }

    async fn connect(&self, host_key: &str) -> ConnectedSession {
        SessionBuilder::new(TOKEN)
            .with_host_key(host_key)
            .with_timeout(WAIT)
            .connect_tcp(self.tcp_addr())
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.handle.shutdown();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }
}

/// Poll until the host table reports `live` hosts
async fn wait_for_live_hosts(supervisor: &HostSupervisor, live: usize) {
    tokio::time::timeout(WAIT, async {
        while supervisor.stats().await.live_hosts != live {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_management_echo_and_exec() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;
    let session = agent.connect("ws-A").await;
    let context = session.context();

    context.ping().await.unwrap();

    let info = context.host_info().await.unwrap();
    assert_eq!(info.host_key, "ws-A");
    assert_eq!(Some(info.pid), session.host_pid());

    let reply = context.echo(Bytes::from("hello relay")).await.unwrap();
    assert_eq!(&reply[..], b"hello relay");

    let command: &[&str] = if cfg!(windows) { &["cmd", "/c", "echo", "remote"] } else { &["echo", "remote"] };
    let result = context.proc_exec(command).await.unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(String::from_utf8_lossy(&result.stdout).contains("remote"));

    session.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn test_unknown_channel_kind_is_reset() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;
    let session = agent.connect("ws-A").await;

    let mut channel = session.open_channel("teleport").unwrap();
    let _ = channel.send(Bytes::from("x")).await;
    let ended = tokio::time::timeout(WAIT, channel.recv()).await.unwrap();

    assert!(ended.is_none());
    assert!(channel.error().unwrap().contains("teleport"));
    // The session survives a refused channel
    session.context().ping().await.unwrap();

    session.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;

    let result = SessionBuilder::new("not-the-token")
        .with_timeout(WAIT)
        .connect_tcp(agent.tcp_addr())
        .await;

    assert!(matches!(result, Err(ClientError::Unauthorized)));
    assert_eq!(agent.supervisor.stats().await.total_spawns, 0);
    agent.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_socket_sessions() {
    let agent = TestAgent::start_on(Some("agent.sock"), Duration::from_secs(30)).await;
    let path = agent.socket_path();
    assert!(path.exists());

    let rejected = SessionBuilder::new("wrong").connect_local(&path).await;
    assert!(matches!(rejected, Err(ClientError::Unauthorized)));

    let session = SessionBuilder::new(TOKEN).with_host_key("ws-L").connect_local(&path).await.unwrap();
    session.context().ping().await.unwrap();
    session.close().await;

    agent.stop().await;
    assert!(!path.exists());
}

/// Handshake by hand so the test can send frames the client library never would
async fn raw_session(addr: SocketAddr) -> (TcpStream, FrameCodec) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut codec = FrameCodec::new();

    let handshake = message::encode(&Handshake::new(TOKEN, "ws-A")).unwrap();
    codec.write_frame(&mut stream, &Frame::data(CONTROL_CHANNEL, handshake)).await.unwrap();

    let frame = codec.read_frame(&mut stream).await.unwrap().unwrap();
    let reply: HandshakeReply = message::decode(&frame.payload).unwrap();
    assert!(matches!(reply, HandshakeReply::Welcome { .. }));
    (stream, codec)
}

#[tokio::test]
async fn test_replies_survive_client_half_close() {
    use tokio::io::AsyncWriteExt;

    let agent = TestAgent::start(Duration::from_secs(30)).await;
    let (mut stream, mut codec) = raw_session(agent.tcp_addr()).await;

    let open = message::encode(&ChannelOpen::new("echo")).unwrap();
    codec.write_frame(&mut stream, &Frame::open(1, open)).await.unwrap();
    codec.write_frame(&mut stream, &Frame::data(1, Bytes::from("ping"))).await.unwrap();
    // Done sending; keep reading
    stream.shutdown().await.unwrap();

    let frames = tokio::time::timeout(WAIT, async {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = codec.read_frame(&mut stream).await {
            frames.push(frame);
        }
        frames
    })
    .await
    .unwrap();

    let data: Vec<_> = frames
        .iter()
        .filter(|f| f.channel_id == 1 && f.flags == hostrelay::proto::FrameFlags::NONE)
        .map(|f| f.payload.clone())
        .collect();
    assert_eq!(data, vec![Bytes::from("ping")]);
    let last = frames.iter().rev().find(|f| f.channel_id == 1).unwrap();
    assert!(last.is_end_stream());

    agent.stop().await;
}

#[tokio::test]
async fn test_duplicate_channel_ends_only_that_session() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;
    let bystander = agent.connect("ws-A").await;

    let (mut stream, mut codec) = raw_session(agent.tcp_addr()).await;
    let open = message::encode(&ChannelOpen::new("echo")).unwrap();
    codec.write_frame(&mut stream, &Frame::open(1, open.clone())).await.unwrap();
    codec.write_frame(&mut stream, &Frame::open(1, open)).await.unwrap();

    let goodbye = tokio::time::timeout(WAIT, async {
        loop {
            let frame = codec.read_frame(&mut stream).await.unwrap().unwrap();
            if frame.channel_id == CONTROL_CHANNEL {
                return message::decode::<ControlMessage>(&frame.payload).unwrap();
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(goodbye, ControlMessage::Goodbye { reason: GoodbyeReason::ProtocolViolation });

    // The agent closes the offending connection
    let rest = tokio::time::timeout(WAIT, async {
        while let Ok(Some(_)) = codec.read_frame(&mut stream).await {}
    })
    .await;
    assert!(rest.is_ok());

    bystander.context().ping().await.unwrap();
    bystander.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn test_host_reused_within_grace() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;

    let first = agent.connect("ws-A").await;
    let (host_id, started_at) = (first.host_id(), first.host_started_at_ms());
    first.close().await;

    let second = agent.connect("ws-A").await;
    assert_eq!(second.host_id(), host_id);
    assert_eq!(second.host_started_at_ms(), started_at);
    assert_eq!(agent.supervisor.stats().await.total_spawns, 1);

    second.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn test_new_host_after_grace() {
    let agent = TestAgent::start(Duration::from_millis(200)).await;

    let first = agent.connect("ws-A").await;
    let host_id = first.host_id();
    first.close().await;
    wait_for_live_hosts(&agent.supervisor, 0).await;

    let second = agent.connect("ws-A").await;
    assert_ne!(second.host_id(), host_id);
    assert_eq!(agent.supervisor.stats().await.total_spawns, 2);

    second.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_hosts() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;

    let a = agent.connect("ws-A").await;
    let b = agent.connect("ws-B").await;
    assert_ne!(a.host_id(), b.host_id());
    assert_ne!(a.host_pid(), b.host_pid());
    assert_eq!(agent.supervisor.stats().await.live_hosts, 2);

    a.close().await;
    b.close().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_share_one_host() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;
    let addr = agent.tcp_addr();

    let mut connects = Vec::new();
    for _ in 0..8 {
        connects.push(tokio::spawn(async move {
            SessionBuilder::new(TOKEN).with_host_key("ws-A").connect_tcp(addr).await.unwrap()
        }));
    }
    let mut sessions = Vec::new();
    for connect in connects {
        sessions.push(connect.await.unwrap());
    }

    let host_id = sessions[0].host_id();
    assert!(sessions.iter().all(|s| s.host_id() == host_id));
    assert_eq!(agent.supervisor.stats().await.total_spawns, 1);
    assert_eq!(agent.supervisor.lease_count("ws-A").await, 8);

    for session in sessions {
        session.close().await;
    }
    agent.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_host_crash_ends_attached_sessions() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;
    let first = agent.connect("ws-A").await;
    let second = agent.connect("ws-A").await;
    let pid = first.host_pid().unwrap();

    // A request still running on the host when it dies
    let context = first.context();
    let inflight = tokio::spawn(async move { context.proc_exec(&["sleep", "30"]).await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let reason = tokio::time::timeout(WAIT, first.closed()).await.unwrap();
    assert_eq!(reason, Some(GoodbyeReason::HostTerminated));
    let reason = tokio::time::timeout(WAIT, second.closed()).await.unwrap();
    assert_eq!(reason, Some(GoodbyeReason::HostTerminated));

    let result = tokio::time::timeout(WAIT, inflight).await.unwrap().unwrap();
    match result {
        Err(ClientError::ChannelReset(reason)) => assert_eq!(reason, "host terminated"),
        Err(ClientError::Closed(GoodbyeReason::HostTerminated)) => {}
        other => panic!("in-flight request ended with {:?}", other),
    }
    wait_for_live_hosts(&agent.supervisor, 0).await;

    // A new session gets a fresh host
    let third = agent.connect("ws-A").await;
    assert_ne!(third.host_id(), first.host_id());
    third.context().ping().await.unwrap();

    third.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn test_shutdown_drains_sessions() {
    let agent = TestAgent::start(Duration::from_secs(30)).await;
    let session = agent.connect("ws-A").await;
    session.context().ping().await.unwrap();

    agent.handle.shutdown();
    let reason = tokio::time::timeout(WAIT, session.closed()).await.unwrap();
    assert_eq!(reason, Some(GoodbyeReason::Shutdown));

    let handle = agent.handle.clone();
    let supervisor = agent.supervisor.clone();
    agent.stop().await;

    assert!(handle.is_disposed());
    assert_eq!(supervisor.stats().await.live_hosts, 0);
    // Shutting down twice is harmless
    handle.shutdown();
}
