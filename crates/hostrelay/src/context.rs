//! Execution context for remote operations
//!
//! Each call opens its own channel on the execution host, exchanges one
//! request and reply, and ends the channel.

use crate::session::SessionStatus;
use crate::{ClientError, Result};
use bytes::Bytes;
use hostrelay_proto::message::{self, ExecRequest, ExecResult};
use hostrelay_proto::Multiplexer;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Channel kind answering `ping` and `info`
pub const MANAGEMENT_KIND: &str = "management";
/// Channel kind echoing every message
pub const ECHO_KIND: &str = "echo";
/// Channel kind running commands
pub const EXEC_KIND: &str = "exec";

/// Default timeout for executed commands
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;

/// Reply of the `info` management command
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostInfo {
    /// Host key the execution host serves
    pub host_key: String,
    /// OS process ID of the execution host
    pub pid: u32,
}

/// Execution context for remote operations
#[derive(Clone)]
pub struct Context {
    /// Session ID this context belongs to
    session_id: Uuid,
    /// Channel table of the session link
    mux: Multiplexer,
    /// Session status
    status: watch::Receiver<SessionStatus>,
}

impl Context {
    pub(crate) fn new(session_id: Uuid, mux: Multiplexer, status: watch::Receiver<SessionStatus>) -> Self {
        Self { session_id, mux, status }
    }

    /// Get the session ID
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Check the execution host is responsive; returns the round trip time
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let reply = self.request(MANAGEMENT_KIND, Bytes::from_static(b"ping")).await?;
        if &reply[..] != b"pong" {
            return Err(ClientError::UnexpectedReply(String::from_utf8_lossy(&reply).into_owned()));
        }
        Ok(started.elapsed())
    }

    /// Ask the execution host who it is
    pub async fn host_info(&self) -> Result<HostInfo> {
        let reply = self.request(MANAGEMENT_KIND, Bytes::from_static(b"info")).await?;
        serde_json::from_slice(&reply)
            .map_err(|e| ClientError::UnexpectedReply(format!("Invalid host info: {}", e)))
    }

    /// Send `payload` on an echo channel and return what comes back
    pub async fn echo(&self, payload: Bytes) -> Result<Bytes> {
        self.request(ECHO_KIND, payload).await
    }

    /// Execute a process on the remote host
    pub async fn proc_exec(&self, command: &[&str]) -> Result<ExecResult> {
        let mut request = ExecRequest::new(command.iter().map(|s| s.to_string()).collect());
        request.timeout_secs = Some(DEFAULT_EXEC_TIMEOUT_SECS);
        self.exec(request).await
    }

    /// Execute a process with environment variables, working directory and stdin
    pub async fn proc_exec_with_env(
        &self,
        command: &[&str],
        env: HashMap<String, String>,
        cwd: Option<&Path>,
        stdin: Option<&[u8]>,
    ) -> Result<ExecResult> {
        let request = ExecRequest {
            command: command.iter().map(|s| s.to_string()).collect(),
            env,
            cwd: cwd.map(|p| p.to_path_buf()),
            stdin: stdin.map(Bytes::copy_from_slice),
            timeout_secs: Some(DEFAULT_EXEC_TIMEOUT_SECS),
        };
        self.exec(request).await
    }

    /// Run an [`ExecRequest`] on the remote host
    pub async fn exec(&self, request: ExecRequest) -> Result<ExecResult> {
        debug!("Executing process: {:?}", request.command);
        let reply = self.request(EXEC_KIND, message::encode(&request)?).await?;
        Ok(message::decode(&reply)?)
    }

    /// Open a channel of `kind`, send one message and wait for one reply
    async fn request(&self, kind: &str, payload: Bytes) -> Result<Bytes> {
        let status = *self.status.borrow();
        if status != SessionStatus::Active {
            return Err(status.closed_error());
        }

        let mut channel = self.mux.open_channel(kind)?;
        channel.send(payload).await?;

        let reply = channel.recv().await;
        let _ = channel.close();

        match reply {
            Some(reply) => Ok(reply),
            None => match channel.error() {
                Some(reason) => Err(ClientError::ChannelReset(reason)),
                None => {
                    let status = *self.status.borrow();
                    if status == SessionStatus::Active {
                        Err(ClientError::UnexpectedReply("channel ended without a reply".to_string()))
                    } else {
                        Err(status.closed_error())
                    }
                }
            },
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("session_id", &self.session_id).finish()
    }
}
