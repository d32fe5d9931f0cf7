//! # hostrelay protocol
//!
//! Frame format, codec, handshake messages and the channel multiplexer shared
//! by the hostrelay agent, its execution hosts and its clients.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Handshake, control and channel messages
pub mod message;

/// Frame codec for async streams
pub mod codec;

/// Channel multiplexing and flow control
pub mod channel;

/// Error types for protocol operations
pub mod error;

pub use frame::{Frame, FrameFlags, CONTROL_CHANNEL};
pub use message::{ChannelOpen, ControlMessage, GoodbyeReason, Handshake, HandshakeReply};
pub use codec::FrameCodec;
pub use channel::{Channel, ChannelReceiver, ChannelSender, ChannelState, FlowControlConfig, Multiplexer};
pub use error::ProtocolError;
