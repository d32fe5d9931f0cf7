//! Listener abstraction over TCP and local sockets

use crate::config::TransportConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Bidirectional byte stream accepted from a listener
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased accepted stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Address a listener is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP socket address
    Tcp(SocketAddr),
    /// Unix socket path or pipe name
    Local(PathBuf),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{}", addr),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Source of incoming connections
#[async_trait]
pub trait TransportListener: Send {
    /// Wait for the next connection; returns the stream and a peer label for logs
    async fn accept(&mut self) -> Result<(BoxedStream, String)>;

    /// Address the listener is bound to
    fn local_addr(&self) -> ListenAddr;

    /// Stop listening and remove any filesystem artifact
    fn close(&mut self);
}

/// Bind the configured transport
pub async fn bind_listener(config: &TransportConfig) -> Result<Box<dyn TransportListener>> {
    match config {
        TransportConfig::Tcp { host, port } => {
            let target = TransportConfig::tcp_bind_address(host.as_deref(), *port);
            let listener = TcpTransport::bind(&target).await?;
            Ok(Box::new(listener))
        }
        #[cfg(unix)]
        TransportConfig::Local { path } => Ok(Box::new(UnixTransport::bind(path.clone())?)),
        #[cfg(windows)]
        TransportConfig::Local { path } => Ok(Box::new(PipeTransport::bind(path.clone())?)),
    }
}

/// TCP listener
pub struct TcpTransport {
    listener: Option<TcpListener>,
    addr: SocketAddr,
}

impl TcpTransport {
    /// Bind `target` (`host:port`)
    pub async fn bind(target: &str) -> Result<Self> {
        let listener = TcpListener::bind(target).await.map_err(|source| AgentError::Bind {
            target: target.to_string(),
            source,
        })?;
        let addr = listener.local_addr()?;
        info!("Listening on tcp://{}", addr);

        Ok(Self { listener: Some(listener), addr })
    }
}

#[async_trait]
impl TransportListener for TcpTransport {
    async fn accept(&mut self) -> Result<(BoxedStream, String)> {
        let listener = self.listener.as_ref().ok_or(AgentError::ShuttingDown)?;
        let (stream, peer) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_addr(&self) -> ListenAddr {
        ListenAddr::Tcp(self.addr)
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!("Closed tcp listener {}", self.addr);
        }
    }
}

/// Unix domain socket listener, readable and writable by the owner only
#[cfg(unix)]
pub struct UnixTransport {
    listener: Option<tokio::net::UnixListener>,
    path: PathBuf,
}

#[cfg(unix)]
impl UnixTransport {
    /// Bind `path`, replacing a stale socket left by an earlier run
    pub fn bind(path: PathBuf) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let bind_error = |source| AgentError::Bind {
            target: path.display().to_string(),
            source,
        };

        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_error(e)),
        }

        let listener = tokio::net::UnixListener::bind(&path).map_err(bind_error)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(bind_error)?;
        info!("Listening on unix://{}", path.display());

        Ok(Self { listener: Some(listener), path })
    }
}

#[cfg(unix)]
#[async_trait]
impl TransportListener for UnixTransport {
    async fn accept(&mut self) -> Result<(BoxedStream, String)> {
        let listener = self.listener.as_ref().ok_or(AgentError::ShuttingDown)?;
        let (stream, _) = listener.accept().await?;
        Ok((Box::new(stream), format!("unix:{}", self.path.display())))
    }

    fn local_addr(&self) -> ListenAddr {
        ListenAddr::Local(self.path.clone())
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove socket {}: {}", self.path.display(), e);
                }
            }
            debug!("Closed unix listener {}", self.path.display());
        }
    }
}

#[cfg(unix)]
impl Drop for UnixTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Windows named pipe listener
#[cfg(windows)]
pub struct PipeTransport {
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
    name: PathBuf,
}

#[cfg(windows)]
impl PipeTransport {
    /// Create the first pipe instance
    pub fn bind(name: PathBuf) -> Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|source| AgentError::Bind {
                target: name.display().to_string(),
                source,
            })?;
        info!("Listening on pipe {}", name.display());

        Ok(Self { server: Some(server), name })
    }
}

#[cfg(windows)]
#[async_trait]
impl TransportListener for PipeTransport {
    async fn accept(&mut self) -> Result<(BoxedStream, String)> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let server = self.server.as_ref().ok_or(AgentError::ShuttingDown)?;
        server.connect().await?;

        // Hand out the connected instance and keep a fresh one listening
        let next = ServerOptions::new().create(&self.name)?;
        let connected = self.server.replace(next).ok_or(AgentError::ShuttingDown)?;
        Ok((Box::new(connected), format!("pipe:{}", self.name.display())))
    }

    fn local_addr(&self) -> ListenAddr {
        ListenAddr::Local(self.name.clone())
    }

    fn close(&mut self) {
        self.server = None;
    }
}
