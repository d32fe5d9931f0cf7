//! Resolved agent configuration

use crate::error::{AgentError, Result};
use crate::management::ManagementCommand;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Port used when none is given or the given one does not parse
pub const DEFAULT_PORT: u16 = 8000;

/// Environment variable overriding the agent data folder
pub const AGENT_FOLDER_ENV: &str = "HOSTRELAY_AGENT_FOLDER";

/// Folder name under the home directory when no override is set
pub const DEFAULT_FOLDER_NAME: &str = ".hostrelay-remote";

/// Where the agent listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// TCP listener; `None` or empty host binds every interface
    Tcp {
        /// Interface to bind
        host: Option<String>,
        /// Port to bind
        port: u16,
    },
    /// Unix domain socket or Windows named pipe
    Local {
        /// Socket path or pipe name
        path: PathBuf,
    },
}

impl TransportConfig {
    /// `host:port` string for a TCP bind, with an empty host meaning all interfaces
    pub fn tcp_bind_address(host: Option<&str>, port: u16) -> String {
        match host.map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) if host.contains(':') && !host.starts_with('[') => format!("[{}]:{}", host, port),
            Some(host) => format!("{}:{}", host, port),
            None => format!("0.0.0.0:{}", port),
        }
    }

    /// Human readable listen target
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp { host, port } => Self::tcp_bind_address(host.as_deref(), *port),
            Self::Local { path } => path.display().to_string(),
        }
    }
}

/// Managed data directories, all derived from one root folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirs {
    /// Root data folder
    pub root: PathBuf,
    /// User data folder (`root/data`)
    pub user_data: PathBuf,
    /// Per-user settings (`root/data/User`)
    pub app_settings: PathBuf,
    /// Global storage (`root/data/User/globalStorage`)
    pub global_storage: PathBuf,
    /// Machine-level settings (`root/data/Machine`)
    pub machine_settings: PathBuf,
    /// Installed capabilities
    pub extensions: PathBuf,
}

impl DataDirs {
    /// Derive every directory from `root`, optionally relocating extensions
    pub fn from_root(root: impl Into<PathBuf>, extensions: Option<PathBuf>) -> Self {
        let root = root.into();
        let user_data = root.join("data");
        let app_settings = user_data.join("User");
        let global_storage = app_settings.join("globalStorage");
        let machine_settings = user_data.join("Machine");
        let extensions = extensions.unwrap_or_else(|| root.join("extensions"));

        Self {
            root,
            user_data,
            app_settings,
            global_storage,
            machine_settings,
            extensions,
        }
    }

    /// Pick the root folder from the environment override or the home directory
    pub fn resolve_root(env_value: Option<OsString>, home: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(value) = env_value.filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(value));
        }
        home.map(|home| home.join(DEFAULT_FOLDER_NAME)).ok_or_else(|| {
            AgentError::Config(format!(
                "cannot determine home directory; set {}",
                AGENT_FOLDER_ENV
            ))
        })
    }

    /// Every managed directory, parents first
    pub fn all(&self) -> [&Path; 6] {
        [
            &self.root,
            &self.extensions,
            &self.user_data,
            &self.app_settings,
            &self.machine_settings,
            &self.global_storage,
        ]
    }

    /// Create every missing directory; safe to call repeatedly
    pub fn ensure(&self) -> Result<()> {
        for dir in self.all() {
            std::fs::create_dir_all(dir).map_err(|source| AgentError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
            debug!("Ensured directory {}", dir.display());
        }
        Ok(())
    }
}

/// What to do once no execution host is alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoShutdown {
    /// Keep running
    Disabled,
    /// Shut down after the host table stayed empty for the given window
    AfterIdle(Duration),
    /// Shut down as soon as the host table becomes empty
    Immediate,
}

/// Secret every client must present
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionToken(String);

impl ConnectionToken {
    /// Wrap an externally supplied token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a fresh random token
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The secret itself; only for handing it to a trusted client
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionToken(<redacted>)")
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Program launched for every execution host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    /// Executable path
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<String>,
}

impl HostCommand {
    /// Launch `program` with `args`
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The `hostrelay-host` binary installed next to the running executable
    pub fn sibling_default() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            AgentError::Config(format!("executable {} has no parent directory", exe.display()))
        })?;
        let program = dir.join(format!("hostrelay-host{}", std::env::consts::EXE_SUFFIX));
        Ok(Self::new(program, Vec::new()))
    }

    /// Command line for logs and errors
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Validated configuration; immutable after resolution
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Listen target
    pub transport: TransportConfig,
    /// Managed directories
    pub dirs: DataDirs,
    /// Auto-shutdown policy
    pub auto_shutdown: AutoShutdown,
    /// Connection token
    pub token: ConnectionToken,
    /// Execution host launcher
    pub host_command: HostCommand,
    /// How long a host with no sessions survives, to absorb reconnects
    pub host_grace: Duration,
    /// Bound on flushing a draining session
    pub drain_grace: Duration,
    /// Bound on receiving the client handshake
    pub handshake_timeout: Duration,
    /// One-shot management directive; set means the agent never binds
    pub management: Option<ManagementCommand>,
}

impl AgentConfig {
    /// Configuration with default timings, auto-shutdown disabled and no directive
    pub fn new(
        transport: TransportConfig,
        dirs: DataDirs,
        token: ConnectionToken,
        host_command: HostCommand,
    ) -> Self {
        Self {
            transport,
            dirs,
            auto_shutdown: AutoShutdown::Disabled,
            token,
            host_command,
            host_grace: Duration::from_secs(3 * 60 * 60),
            drain_grace: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            management: None,
        }
    }

    /// Set the auto-shutdown policy
    pub fn with_auto_shutdown(mut self, policy: AutoShutdown) -> Self {
        self.auto_shutdown = policy;
        self
    }

    /// Set the host reclamation grace period
    pub fn with_host_grace(mut self, grace: Duration) -> Self {
        self.host_grace = grace;
        self
    }

    /// Set the session drain bound
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Attach a one-shot management directive
    pub fn with_management(mut self, command: ManagementCommand) -> Self {
        self.management = Some(command);
        self
    }
}
