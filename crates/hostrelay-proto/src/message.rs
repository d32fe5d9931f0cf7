//! Handshake, control and channel-open messages
//!
//! These travel as MessagePack payloads: the handshake and control messages on
//! [`CONTROL_CHANNEL`](crate::frame::CONTROL_CHANNEL), channel descriptions in
//! `OPEN` frames, and exec requests on `exec` channels.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;
use crate::ProtocolError;

/// The only rejection text a client ever sees
pub const UNAUTHORIZED: &str = "unauthorized";

/// Serialize a message to a MessagePack payload
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(message)?))
}

/// Deserialize a MessagePack payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// First message a client sends on the control channel
#[derive(Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Connection token presented by the client
    pub token: String,
    /// Identity used to select or create the execution host
    pub host_key: String,
    /// Free-form client version string
    pub client_version: String,
}

impl Handshake {
    /// Create a handshake for the given token and host key
    pub fn new(token: impl Into<String>, host_key: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            host_key: host_key.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("token", &"<redacted>")
            .field("host_key", &self.host_key)
            .field("client_version", &self.client_version)
            .finish()
    }
}

/// Agent answer to a [`Handshake`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeReply {
    /// Session accepted and attached to an execution host
    Welcome {
        /// Session ID assigned by the agent
        session_id: Uuid,
        /// Identity of the execution host instance
        host_id: Uuid,
        /// OS process ID of the execution host, when known
        host_pid: Option<u32>,
        /// Spawn time of the execution host (unix millis)
        host_started_at_ms: u64,
    },
    /// Session refused
    Rejected {
        /// Always [`UNAUTHORIZED`]
        reason: String,
    },
}

impl HandshakeReply {
    /// The fixed rejection reply
    pub fn unauthorized() -> Self {
        Self::Rejected { reason: UNAUTHORIZED.to_string() }
    }
}

/// Why the agent is ending a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoodbyeReason {
    /// The execution host process exited
    HostTerminated,
    /// The execution host could not be started
    HostUnavailable,
    /// The client broke the framing or channel rules
    ProtocolViolation,
    /// The agent is shutting down
    Shutdown,
}

impl fmt::Display for GoodbyeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::HostTerminated => "host terminated",
            Self::HostUnavailable => "host unavailable",
            Self::ProtocolViolation => "protocol violation",
            Self::Shutdown => "agent shutting down",
        };
        f.write_str(text)
    }
}

/// Messages sent on the control channel after the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// The session is about to close
    Goodbye {
        /// Reason for closing
        reason: GoodbyeReason,
    },
}

/// Payload of an `OPEN` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpen {
    /// Channel kind, e.g. `management`, `echo`, `exec`
    pub kind: String,
}

impl ChannelOpen {
    /// Describe a channel of the given kind
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

/// Command to run on an `exec` channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Standard input data
    pub stdin: Option<Bytes>,
    /// Timeout in seconds
    pub timeout_secs: Option<u64>,
}

impl ExecRequest {
    /// Run `command` with no extra environment, stdin or timeout
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: HashMap::new(),
            cwd: None,
            stdin: None,
            timeout_secs: None,
        }
    }
}

/// Outcome of an [`ExecRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit code, `-1` when the process could not run or was killed
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: Bytes,
    /// Captured standard error, or the failure description
    pub stderr: Bytes,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl ExecResult {
    /// A result describing a failure to run the command at all
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: Bytes::new(),
            stderr: Bytes::from(message.into()),
            duration_ms: 0,
        }
    }
}
