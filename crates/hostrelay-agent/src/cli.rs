//! Command line parsing and configuration resolution

use crate::config::{
    AgentConfig, AutoShutdown, ConnectionToken, DataDirs, HostCommand, TransportConfig,
    AGENT_FOLDER_ENV, DEFAULT_PORT,
};
use crate::error::Result;
use crate::management::{ManagementAction, ManagementCommand};
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Command line of the `hostrelay-agent` binary
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "hostrelay-agent", bin_name = "hostrelay-agent")]
#[command(about = "Remote execution agent serving multiplexed sessions", version)]
pub struct AgentCli {
    /// Interface to bind; all interfaces when empty
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind; unparsable values fall back to 8000
    #[arg(long)]
    pub port: Option<String>,

    /// Unix socket path or named pipe; takes precedence over host/port
    #[arg(long = "socket-path")]
    pub socket_path: Option<PathBuf>,

    /// Secret clients must present; generated when absent
    #[arg(long = "connection-token", alias = "connectionToken")]
    pub connection_token: Option<String>,

    /// Override the extensions folder
    #[arg(long = "extensions-dir")]
    pub extensions_dir: Option<PathBuf>,

    /// Exit once no execution host has been alive for the delay
    #[arg(long)]
    pub enable_remote_auto_shutdown: bool,

    /// Exit as soon as the last execution host goes away
    #[arg(long)]
    pub remote_auto_shutdown_without_delay: bool,

    /// Idle window for auto-shutdown
    #[arg(long, default_value_t = 300)]
    pub auto_shutdown_delay_secs: u64,

    /// Execution host program; defaults to `hostrelay-host` next to this binary
    #[arg(long)]
    pub host_command: Option<PathBuf>,

    /// Argument for the execution host program (repeatable)
    #[arg(long = "host-arg", allow_hyphen_values = true)]
    pub host_args: Vec<String>,

    /// Seconds an unused execution host survives before it is reclaimed
    #[arg(long, default_value_t = 10800)]
    pub host_grace_secs: u64,

    /// Seconds a closing session may spend flushing
    #[arg(long, default_value_t = 5)]
    pub drain_grace_secs: u64,

    /// Seconds a client has to complete the handshake
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Install capabilities from local directories
    #[arg(long = "install-extension", num_args = 1..)]
    pub install_extension: Vec<String>,

    /// Remove installed capabilities by id
    #[arg(long = "uninstall-extension", num_args = 1..)]
    pub uninstall_extension: Vec<String>,

    /// List installed capabilities
    #[arg(long)]
    pub list_extensions: bool,

    /// Include versions when listing
    #[arg(long)]
    pub show_versions: bool,

    /// Print the install folder of capabilities by id
    #[arg(long = "locate-extension", num_args = 1..)]
    pub locate_extension: Vec<String>,

    /// Replace already installed capabilities
    #[arg(long)]
    pub force: bool,

    /// Mark installed capabilities as excluded from sync
    #[arg(long)]
    pub do_not_sync: bool,

    /// Log filter directive, e.g. `debug` or `hostrelay_agent=trace`
    #[arg(long)]
    pub log: Option<String>,
}

/// Parse a `--port` value, falling back to [`DEFAULT_PORT`]
pub fn parse_port(value: Option<&str>) -> u16 {
    match value {
        None => DEFAULT_PORT,
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                warn!("Invalid port '{}', using {}", raw, DEFAULT_PORT);
                DEFAULT_PORT
            }
        },
    }
}

/// Command line arguments with the connection token masked, for logging
pub fn redacted_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    const TOKEN_FLAGS: [&str; 2] = ["--connection-token", "--connectionToken"];

    let mut redacted = Vec::new();
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            redacted.push("<redacted>".to_string());
            mask_next = false;
        } else if TOKEN_FLAGS.contains(&arg.as_str()) {
            redacted.push(arg);
            mask_next = true;
        } else if let Some(flag) = TOKEN_FLAGS.iter().find(|f| arg.starts_with(&format!("{}=", f))) {
            redacted.push(format!("{}=<redacted>", flag));
        } else {
            redacted.push(arg);
        }
    }
    redacted
}

impl AgentCli {
    /// Listen target; a socket path wins over host/port
    pub fn transport(&self) -> TransportConfig {
        match &self.socket_path {
            Some(path) => TransportConfig::Local { path: path.clone() },
            None => TransportConfig::Tcp {
                host: self.host.clone(),
                port: parse_port(self.port.as_deref()),
            },
        }
    }

    /// Auto-shutdown policy from the two enabling flags
    pub fn auto_shutdown(&self) -> AutoShutdown {
        if self.remote_auto_shutdown_without_delay {
            AutoShutdown::Immediate
        } else if self.enable_remote_auto_shutdown {
            AutoShutdown::AfterIdle(Duration::from_secs(self.auto_shutdown_delay_secs))
        } else {
            AutoShutdown::Disabled
        }
    }

    /// Management directive, if any directive flag was given
    pub fn management(&self) -> Option<ManagementCommand> {
        let mut actions = Vec::new();
        if self.list_extensions {
            actions.push(ManagementAction::List { show_versions: self.show_versions });
        }
        if !self.install_extension.is_empty() {
            actions.push(ManagementAction::Install(self.install_extension.clone()));
        }
        if !self.uninstall_extension.is_empty() {
            actions.push(ManagementAction::Uninstall(self.uninstall_extension.clone()));
        }
        if !self.locate_extension.is_empty() {
            actions.push(ManagementAction::Locate(self.locate_extension.clone()));
        }

        if actions.is_empty() {
            return None;
        }
        Some(ManagementCommand {
            actions,
            force: self.force,
            do_not_sync: self.do_not_sync,
        })
    }

    /// Resolve against the process environment
    pub fn resolve(&self) -> Result<AgentConfig> {
        self.resolve_with(std::env::var_os(AGENT_FOLDER_ENV), dirs::home_dir())
    }

    /// Resolve with an explicit folder override and home directory
    pub fn resolve_with(
        &self,
        folder_env: Option<OsString>,
        home: Option<PathBuf>,
    ) -> Result<AgentConfig> {
        let root = DataDirs::resolve_root(folder_env, home)?;
        let dirs = DataDirs::from_root(root, self.extensions_dir.clone());

        let token = match self.connection_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => ConnectionToken::new(token),
            None => ConnectionToken::generate(),
        };

        let host_command = match &self.host_command {
            Some(program) => HostCommand::new(program.clone(), self.host_args.clone()),
            None => {
                let mut command = HostCommand::sibling_default()?;
                command.args = self.host_args.clone();
                command
            }
        };

        let mut config = AgentConfig::new(self.transport(), dirs, token, host_command)
            .with_auto_shutdown(self.auto_shutdown())
            .with_host_grace(Duration::from_secs(self.host_grace_secs))
            .with_drain_grace(Duration::from_secs(self.drain_grace_secs))
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs));

        if let Some(command) = self.management() {
            config = config.with_management(command);
        }
        Ok(config)
    }
}
