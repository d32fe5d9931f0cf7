//! Agent server: accept loop, auto-shutdown and disposal

use crate::auth::TokenAuthenticator;
use crate::config::{AgentConfig, AutoShutdown};
use crate::error::{AgentError, Result};
use crate::session::{Session, SessionContext};
use crate::supervisor::HostSupervisor;
use crate::transport::{bind_listener, ListenAddr, TransportListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause after a failed accept so a persistent error cannot spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Requests agent shutdown; clones share the same signal
#[derive(Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
    disposed: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Ask the agent to stop; later calls are no-ops
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
            self.token.cancel();
        }
    }

    /// Whether shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether disposal has started
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Wait for a shutdown request
    pub async fn requested(&self) {
        self.token.cancelled().await
    }
}

/// The agent in server mode
pub struct AgentServer {
    config: Arc<AgentConfig>,
    listener: Box<dyn TransportListener>,
    supervisor: HostSupervisor,
    authenticator: Arc<TokenAuthenticator>,
    handle: ShutdownHandle,
}

impl AgentServer {
    /// Create the data directories and bind the configured transport
    pub async fn bind(config: AgentConfig) -> Result<Self> {
        if config.management.is_some() {
            return Err(AgentError::Config(
                "management directives run without a server".to_string(),
            ));
        }
        config.dirs.ensure()?;

        trace!("Data folder: {}", config.dirs.root.display());
        trace!("Resolved configuration: {:?}", config);

        let listener = bind_listener(&config.transport).await?;
        let supervisor = HostSupervisor::new(
            config.host_command.clone(),
            config.dirs.clone(),
            config.host_grace,
        );
        let authenticator = Arc::new(TokenAuthenticator::new(&config.token));

        Ok(Self {
            config: Arc::new(config),
            listener,
            supervisor,
            authenticator,
            handle: ShutdownHandle {
                token: CancellationToken::new(),
                disposed: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// Address the agent listens on
    pub fn local_addr(&self) -> ListenAddr {
        self.listener.local_addr()
    }

    /// Handle for stopping the agent from elsewhere
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Host registry
    pub fn supervisor(&self) -> &HostSupervisor {
        &self.supervisor
    }

    /// Accept sessions until shutdown, then dispose of everything
    pub async fn run(mut self) -> Result<()> {
        log_banner();
        info!("Agent listening on {}", self.listener.local_addr());

        let token = self.handle.token.clone();
        let monitor = tokio::spawn(auto_shutdown_monitor(
            self.config.auto_shutdown,
            self.supervisor.idle_watch(),
            self.handle.clone(),
        ));

        let ctx = SessionContext {
            config: Arc::clone(&self.config),
            supervisor: self.supervisor.clone(),
            authenticator: Arc::clone(&self.authenticator),
        };
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let session = Session::new(peer, ctx.clone());
                        sessions.spawn(session.run(stream, token.child_token()));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_result(finished);
                }
            }
        }

        monitor.abort();
        self.dispose(sessions).await;
        Ok(())
    }

    async fn dispose(&mut self, mut sessions: JoinSet<Result<()>>) {
        if self.handle.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping agent");

        self.listener.close();
        self.handle.token.cancel();

        // Sessions drain on the cancelled token; give them the grace to flush
        let grace = self.config.drain_grace + Duration::from_millis(500);
        let drained = tokio::time::timeout(grace, async {
            while let Some(finished) = sessions.join_next().await {
                log_session_result(finished);
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} sessions did not drain in time; aborting", sessions.len());
            sessions.shutdown().await;
        }

        self.supervisor.shutdown().await;
        info!("Agent stopped");
    }
}

fn log_session_result(finished: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(AgentError::Unauthorized)) => {}
        Ok(Err(e)) => debug!("Session ended with error: {}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!("Session task failed: {}", e),
    }
}

fn log_banner() {
    info!("*");
    info!("* hostrelay-agent {}", env!("CARGO_PKG_VERSION"));
    info!("* Use of this agent is subject to its license terms.");
    info!("* Anyone holding the connection token can run commands as this user.");
    info!("* Keep the token secret and prefer a local socket over a public port.");
    info!("*");
}

/// Cancel `handle` according to `policy` once no host is alive
async fn auto_shutdown_monitor(
    policy: AutoShutdown,
    mut hosts: watch::Receiver<usize>,
    handle: ShutdownHandle,
) {
    match policy {
        AutoShutdown::Disabled => {}
        AutoShutdown::Immediate => {
            if hosts.wait_for(|count| *count > 0).await.is_err() {
                return;
            }
            if hosts.wait_for(|count| *count == 0).await.is_err() {
                return;
            }
            info!("Last execution host is gone; shutting down");
            handle.shutdown();
        }
        AutoShutdown::AfterIdle(delay) => loop {
            if hosts.wait_for(|count| *count == 0).await.is_err() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    info!("No execution host for {:?}; shutting down", delay);
                    handle.shutdown();
                    return;
                }
                busy = hosts.wait_for(|count| *count > 0) => {
                    if busy.is_err() {
                        return;
                    }
                }
            }
        },
    }
}
