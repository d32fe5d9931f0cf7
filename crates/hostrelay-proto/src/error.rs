//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport read or write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize
    },

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Frame addressed to a channel that is not open
    #[error("Unknown channel ID: {0}")]
    UnknownChannel(u32),

    /// Open frame for a channel ID that is already open
    #[error("Duplicate channel ID: {0}")]
    DuplicateChannel(u32),

    /// Flow control violation
    #[error("Flow control violation on channel {0}")]
    FlowControlViolation(u32),
}

impl ProtocolError {
    /// Whether this error must terminate the whole session.
    ///
    /// Frames racing a local close land on an unknown channel and are only
    /// logged; everything else on the inbound path is a protocol violation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnknownChannel(_) | Self::ChannelClosed)
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}
