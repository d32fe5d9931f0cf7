//! Error types for the client

use hostrelay_proto::{GoodbyeReason, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// The agent could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The agent refused the connection token
    #[error("unauthorized")]
    Unauthorized,

    /// Framing or channel rules were broken
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The agent ended the session
    #[error("Session closed: {0}")]
    Closed(GoodbyeReason),

    /// The connection went away without a reason
    #[error("Disconnected")]
    Disconnected,

    /// The peer reset a channel
    #[error("Channel reset: {0}")]
    ChannelReset(String),

    /// An operation took too long
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Unexpected reply content
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
