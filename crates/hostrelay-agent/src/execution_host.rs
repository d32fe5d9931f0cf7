//! Agent-side handle of one execution host process

use crate::config::{DataDirs, HostCommand};
use crate::error::{AgentError, Result};
use hostrelay_proto::{Channel, FrameCodec, Multiplexer};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Environment variable carrying the host key
pub const HOST_KEY_ENV: &str = "HOSTRELAY_HOST_KEY";
/// Environment variable carrying the user data folder
pub const USER_DATA_DIR_ENV: &str = "HOSTRELAY_USER_DATA_DIR";
/// Environment variable carrying the extensions folder
pub const EXTENSIONS_DIR_ENV: &str = "HOSTRELAY_EXTENSIONS_DIR";
/// Environment variable carrying the global storage folder
pub const GLOBAL_STORAGE_DIR_ENV: &str = "HOSTRELAY_GLOBAL_STORAGE_DIR";

/// Lifecycle of the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// The process is alive
    Running,
    /// The process is gone; exit code when it exited normally
    Exited(Option<i32>),
}

/// A spawned execution host and the frame link over its stdin/stdout
pub struct ExecutionHost {
    key: String,
    id: Uuid,
    pid: Option<u32>,
    started_at: SystemTime,
    mux: Multiplexer,
    status: watch::Receiver<HostStatus>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    link_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionHost {
    /// Spawn the host process for `key` and start its link tasks
    pub fn spawn(key: &str, command: &HostCommand, dirs: &DataDirs) -> Result<Arc<Self>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env(HOST_KEY_ENV, key)
            .env(USER_DATA_DIR_ENV, &dirs.user_data)
            .env(EXTENSIONS_DIR_ENV, &dirs.extensions)
            .env(GLOBAL_STORAGE_DIR_ENV, &dirs.global_storage)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| AgentError::HostSpawn {
            command: command.display(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| AgentError::HostSpawn {
            command: command.display(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin not captured"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| AgentError::HostSpawn {
            command: command.display(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout not captured"),
        })?;

        let id = Uuid::new_v4();
        let (mux, outbound) = Multiplexer::new();
        let (status_tx, status) = watch::channel(HostStatus::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(write_link(id, stdin, outbound));
        let reader = tokio::spawn(read_link(id, stdout, mux.clone()));

        let exit_mux = mux.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill of host {} failed: {}", id, e);
                    }
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            info!("Execution host {} exited (code {:?})", id, code);
            // Status first: relays that see their channel end can tell a crash from a close
            status_tx.send_replace(HostStatus::Exited(code));
            exit_mux.abort_all();
        });

        info!("Spawned execution host {} for key '{}' (pid {:?})", id, key, pid);

        Ok(Arc::new(Self {
            key: key.to_string(),
            id,
            pid,
            started_at: SystemTime::now(),
            mux,
            status,
            kill_tx: Mutex::new(Some(kill_tx)),
            link_tasks: Mutex::new(vec![writer, reader]),
        }))
    }

    /// Host key this host serves
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unique identity of this host instance
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// OS process ID
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn time
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Spawn time in milliseconds since the unix epoch
    pub fn started_at_ms(&self) -> u64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Current process status
    pub fn status(&self) -> HostStatus {
        *self.status.borrow()
    }

    /// Watch of the process status
    pub fn status_watch(&self) -> watch::Receiver<HostStatus> {
        self.status.clone()
    }

    /// Wait until the process is gone
    pub async fn exited(&self) -> HostStatus {
        let mut status = self.status.clone();
        let result = match status.wait_for(|s| *s != HostStatus::Running).await {
            Ok(s) => *s,
            Err(_) => HostStatus::Exited(None),
        };
        result
    }

    /// Open a channel of `kind` on the host link
    pub fn open_channel(&self, kind: &str) -> Result<Channel> {
        if self.status() != HostStatus::Running {
            return Err(AgentError::HostTerminated);
        }
        Ok(self.mux.open_channel(kind)?)
    }

    /// Number of channels open on the host link
    pub fn channel_count(&self) -> usize {
        self.mux.channel_count()
    }

    /// Kill the process and wait for it to be reaped
    pub async fn shutdown(&self) {
        let kill = self.kill_tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(kill) = kill {
            debug!("Shutting down execution host {}", self.id);
            self.mux.close_all();
            let _ = kill.send(());
        }
        self.exited().await;

        let tasks: Vec<_> = self.link_tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for ExecutionHost {
    fn drop(&mut self) {
        for task in self.link_tasks.get_mut().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
    }
}

async fn write_link(
    host_id: Uuid,
    mut stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<hostrelay_proto::Frame>,
) {
    let codec = FrameCodec::new();
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = codec.write_frame(&mut stdin, &frame).await {
            debug!("Link to host {} closed: {}", host_id, e);
            break;
        }
    }
}

async fn read_link(host_id: Uuid, mut stdout: ChildStdout, mux: Multiplexer) {
    let mut codec = FrameCodec::new();
    loop {
        match codec.read_frame(&mut stdout).await {
            Ok(Some(frame)) => match mux.route_frame(frame) {
                Ok(None) => {}
                Ok(Some(channel)) => {
                    warn!("Host {} opened channel {}; refusing", host_id, channel.id());
                    let (sender, _) = channel.split();
                    let _ = sender.reset("host-initiated channels are not supported");
                }
                Err(e) if e.is_fatal() => {
                    error!("Host {} broke the link protocol: {}", host_id, e);
                    break;
                }
                Err(e) => debug!("Ignoring frame from host {}: {}", host_id, e),
            },
            Ok(None) => {
                debug!("Host {} closed its output", host_id);
                break;
            }
            Err(e) => {
                error!("Failed to read from host {}: {}", host_id, e);
                break;
            }
        }
    }
    mux.abort_all();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dirs() -> (tempfile::TempDir, DataDirs) {
        let temp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::from_root(temp.path(), None);
        (temp, dirs)
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (_temp, dirs) = dirs();
        let command = HostCommand::new("/nonexistent/hostrelay-host", Vec::new());

        let result = ExecutionHost::spawn("ws", &command, &dirs);
        assert!(matches!(result, Err(AgentError::HostSpawn { .. })));
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let (_temp, dirs) = dirs();
        let command = HostCommand::new("sleep", vec!["60".to_string()]);

        let host = ExecutionHost::spawn("ws", &command, &dirs).unwrap();
        assert_eq!(host.key(), "ws");
        assert!(host.pid().is_some());
        assert!(host.started_at_ms() > 0);
        assert_eq!(host.status(), HostStatus::Running);

        tokio::time::timeout(Duration::from_secs(5), host.shutdown()).await.unwrap();
        assert!(matches!(host.status(), HostStatus::Exited(_)));
        assert!(matches!(host.open_channel("echo"), Err(AgentError::HostTerminated)));
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let (_temp, dirs) = dirs();
        let command = HostCommand::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);

        let host = ExecutionHost::spawn("ws", &command, &dirs).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), host.exited()).await.unwrap();
        assert_eq!(status, HostStatus::Exited(Some(3)));
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let (temp, dirs) = dirs();
        let out = temp.path().join("env.txt");
        let script = format!(
            "echo \"$HOSTRELAY_HOST_KEY|$HOSTRELAY_EXTENSIONS_DIR\" > {}",
            out.display()
        );
        let command = HostCommand::new("sh", vec!["-c".to_string(), script]);

        let host = ExecutionHost::spawn("ws-env", &command, &dirs).unwrap();
        tokio::time::timeout(Duration::from_secs(5), host.exited()).await.unwrap();

        let written = std::fs::read_to_string(out).unwrap();
        assert_eq!(written.trim(), format!("ws-env|{}", dirs.extensions.display()));
    }
}
