//! # Hostrelay
//!
//! Client library for the hostrelay agent: connects over TCP or a local
//! socket, authenticates with the connection token and opens multiplexed
//! channels to the execution host serving a host key.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use hostrelay_proto as proto;

/// Error types for the client
pub mod error;

/// Connecting and session handling
pub mod session;

/// Typed operations on top of a session
pub mod context;

pub use error::ClientError;
pub use session::{ConnectedSession, SessionBuilder, SessionStatus, Welcome};
pub use context::{Context, HostInfo};

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
