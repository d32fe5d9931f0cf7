//! # Hostrelay Agent
//!
//! Long-running agent that accepts authenticated client connections over TCP
//! or a local socket, supervises one execution host process per host key and
//! relays multiplexed channels between the two.

#![warn(missing_docs)]

/// Connection token validation
pub mod auth;

/// Command line parsing and configuration resolution
pub mod cli;

/// Resolved agent configuration
pub mod config;

/// Error types
pub mod error;

/// Agent-side handle of an execution host process
pub mod execution_host;

/// Channel handlers served by the execution host
pub mod handlers;

/// One-shot capability management
pub mod management;

/// Agent server lifecycle
pub mod server;

/// Client sessions
pub mod session;

/// Execution host registry
pub mod supervisor;

/// Listener abstraction over TCP and local sockets
pub mod transport;

/// Execution host frame loop
pub mod worker;

pub use config::{AgentConfig, AutoShutdown, ConnectionToken, DataDirs, HostCommand, TransportConfig};
pub use error::{AgentError, Result};
pub use server::{AgentServer, ShutdownHandle};
pub use supervisor::{HostLease, HostSupervisor};
