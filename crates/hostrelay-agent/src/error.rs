//! Error types for the agent

use hostrelay_proto::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    /// Invalid or unusable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A managed directory could not be created
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The transport could not be bound
    #[error("Failed to bind {target}: {source}")]
    Bind {
        /// Human readable listen target
        target: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The client failed authentication
    #[error("unauthorized")]
    Unauthorized,

    /// Framing or channel rules were broken
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The execution host process could not be started
    #[error("Failed to spawn execution host `{command}`: {source}")]
    HostSpawn {
        /// Command line of the host
        command: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The execution host process exited while in use
    #[error("host terminated")]
    HostTerminated,

    /// A one-shot management directive failed
    #[error("{0}")]
    Management(String),

    /// The agent is shutting down
    #[error("Agent is shutting down")]
    ShuttingDown,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
