//! Channel handlers served by the execution host

use crate::worker::ChannelHandler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hostrelay_proto::message::{self, ExecRequest, ExecResult};
use hostrelay_proto::Channel;
use serde_json::json;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Channel kind of [`ManagementHandler`]
pub const MANAGEMENT_KIND: &str = "management";
/// Channel kind of [`EchoHandler`]
pub const ECHO_KIND: &str = "echo";
/// Channel kind of [`ExecHandler`]
pub const EXEC_KIND: &str = "exec";

/// Answers simple text commands about the host
pub struct ManagementHandler {
    host_key: String,
}

impl ManagementHandler {
    /// Handler for the host serving `host_key`
    pub fn new(host_key: impl Into<String>) -> Self {
        Self { host_key: host_key.into() }
    }

    fn answer(&self, command: &[u8]) -> Bytes {
        match command {
            b"ping" => Bytes::from_static(b"pong"),
            b"info" => {
                let info = json!({
                    "host_key": self.host_key,
                    "pid": std::process::id(),
                });
                Bytes::from(info.to_string())
            }
            _ => Bytes::from_static(b"error: unknown command"),
        }
    }
}

#[async_trait]
impl ChannelHandler for ManagementHandler {
    async fn serve(&self, channel: &mut Channel) -> Result<()> {
        while let Some(command) = channel.recv().await {
            debug!("Management command: {}", String::from_utf8_lossy(&command));
            channel.send(self.answer(&command)).await?;
        }
        Ok(())
    }
}

/// Sends every message straight back
pub struct EchoHandler;

#[async_trait]
impl ChannelHandler for EchoHandler {
    async fn serve(&self, channel: &mut Channel) -> Result<()> {
        while let Some(payload) = channel.recv().await {
            channel.send(payload).await?;
        }
        Ok(())
    }
}

/// Runs commands described by MessagePack [`ExecRequest`]s
pub struct ExecHandler;

impl ExecHandler {
    /// Run one request to completion
    pub async fn execute(request: ExecRequest) -> ExecResult {
        debug!("Executing process: {:?}", request.command);

        let Some((program, args)) = request.command.split_first() else {
            return ExecResult::failure("Empty command");
        };

        let start_time = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ExecResult::failure(format!("Failed to spawn process: {}", e)),
        };

        // Write stdin if provided, then close it so the child sees EOF
        if let Some(mut child_stdin) = child.stdin.take() {
            if let Some(data) = &request.stdin {
                if let Err(e) = child_stdin.write_all(data).await {
                    warn!("Failed to write to process stdin: {}", e);
                }
            }
            drop(child_stdin);
        }

        let output = match request.timeout_secs {
            Some(secs) => {
                // Dropping the timed-out future drops the child, which kills it
                match tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output()).await {
                    Ok(output) => output,
                    Err(_) => return ExecResult::failure("Process execution timed out"),
                }
            }
            None => child.wait_with_output().await,
        };

        match output {
            Ok(output) => ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: Bytes::from(output.stdout),
                stderr: Bytes::from(output.stderr),
                duration_ms: start_time.elapsed().as_millis() as u64,
            },
            Err(e) => ExecResult::failure(format!("Process error: {}", e)),
        }
    }
}

#[async_trait]
impl ChannelHandler for ExecHandler {
    async fn serve(&self, channel: &mut Channel) -> Result<()> {
        while let Some(payload) = channel.recv().await {
            let result = match message::decode::<ExecRequest>(&payload) {
                Ok(request) => Self::execute(request).await,
                Err(e) => ExecResult::failure(format!("Invalid exec request: {}", e)),
            };
            let reply = message::encode(&result).context("Failed to encode exec result")?;
            channel.send(reply).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_management_answers() {
        let handler = ManagementHandler::new("ws-A");

        assert_eq!(&handler.answer(b"ping")[..], b"pong");
        assert_eq!(&handler.answer(b"reboot")[..], b"error: unknown command");

        let info: serde_json::Value = serde_json::from_slice(&handler.answer(b"info")).unwrap();
        assert_eq!(info["host_key"], "ws-A");
        assert_eq!(info["pid"], std::process::id());
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let command = if cfg!(windows) {
            vec!["cmd".to_string(), "/c".to_string(), "echo".to_string(), "hello world".to_string()]
        } else {
            vec!["echo".to_string(), "hello world".to_string()]
        };

        let result = ExecHandler::execute(ExecRequest::new(command)).await;

        assert_eq!(result.exit_code, 0);
        assert!(String::from_utf8_lossy(&result.stdout).contains("hello world"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_env_cwd_and_stdin() {
        let temp = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("TEST_VAR".to_string(), "test_value".to_string());

        let request = ExecRequest {
            command: vec!["sh".to_string(), "-c".to_string(), "echo $TEST_VAR; pwd; cat".to_string()],
            env,
            cwd: Some(temp.path().to_path_buf()),
            stdin: Some(Bytes::from("from stdin")),
            timeout_secs: Some(10),
        };
        let result = ExecHandler::execute(request).await;
        let stdout = String::from_utf8_lossy(&result.stdout).to_string();

        assert_eq!(result.exit_code, 0);
        assert!(stdout.contains("test_value"));
        assert!(stdout.contains(temp.path().file_name().unwrap().to_str().unwrap()));
        assert!(stdout.contains("from stdin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_exit_code_and_stderr() {
        let request = ExecRequest::new(vec!["sh".to_string(), "-c".to_string(), "echo oops >&2; exit 42".to_string()]);
        let result = ExecHandler::execute(request).await;

        assert_eq!(result.exit_code, 42);
        assert_eq!(String::from_utf8_lossy(&result.stderr).trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_timeout() {
        let mut request = ExecRequest::new(vec!["sleep".to_string(), "30".to_string()]);
        request.timeout_secs = Some(1);

        let started = Instant::now();
        let result = ExecHandler::execute(request).await;

        assert_eq!(result.exit_code, -1);
        assert!(String::from_utf8_lossy(&result.stderr).contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_exec_failures() {
        let result = ExecHandler::execute(ExecRequest::new(Vec::new())).await;
        assert_eq!(result.exit_code, -1);
        assert_eq!(&result.stderr[..], b"Empty command");

        let result = ExecHandler::execute(ExecRequest::new(vec!["/nonexistent/program".to_string()])).await;
        assert_eq!(result.exit_code, -1);
        assert!(String::from_utf8_lossy(&result.stderr).contains("Failed to spawn"));
    }
}
