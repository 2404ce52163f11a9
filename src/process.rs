//! Language server process management.
//!
//! Spawns the server with piped stdio, hands its stdout/stdin to the
//! caller as the session's byte stream, and drains stderr into the log.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;

/// A running language server.
///
/// The process is killed if this handle is dropped while it is still alive.
pub struct ServerProcess {
    child: Child,
}

/// The server's stdio, as seen from the client.
pub struct ServerIo {
    /// Inbound stream (server → client).
    pub stdout: ChildStdout,
    /// Outbound stream (client → server).
    pub stdin: ChildStdin,
}

impl ServerProcess {
    /// Spawn the configured server.
    ///
    /// The server runs in the workspace root when one is configured.
    pub fn spawn(config: &ClientConfig) -> Result<(Self, ServerIo)> {
        info!(
            "Starting language server: {} {}",
            config.server_command,
            config.server_args.join(" ")
        );

        let mut command = Command::new(&config.server_command);
        command
            .args(&config.server_args)
            .envs(config.server_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(root) = config.root_path.as_deref().filter(|p| p.is_dir()) {
            command.current_dir(root);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn language server: {}", config.server_command))?;

        let stdin = child
            .stdin
            .take()
            .context("Failed to get stdin handle for language server")?;
        let stdout = child
            .stdout
            .take()
            .context("Failed to get stdout handle for language server")?;
        let stderr = child
            .stderr
            .take()
            .context("Failed to get stderr handle for language server")?;

        tokio::spawn(drain_stderr(stderr));

        Ok((Self { child }, ServerIo { stdout, stdin }))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait up to `grace` for the server to exit, then kill it.
    pub async fn wait_or_kill(mut self, grace: Duration) -> Result<ExitStatus> {
        match timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for language server")?;
                debug!("Language server exited with {}", status);
                Ok(status)
            }
            Err(_) => {
                warn!("Language server didn't exit gracefully, killing");
                self.child
                    .kill()
                    .await
                    .context("Failed to kill language server")?;
                self.child
                    .wait()
                    .await
                    .context("Failed to reap language server")
            }
        }
    }
}

/// Log each stderr line from the server until it closes.
async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    warn!("Server stderr: {}", trimmed);
                }
            }
            Ok(None) => {
                debug!("Server stderr closed");
                break;
            }
            Err(e) => {
                debug!("Error reading server stderr: {}", e);
                break;
            }
        }
    }
}
