//! Remote execution transport
//!
//! The orchestration engine only consumes the [`Transport`] capability; the
//! default implementation shells out to the system `ssh` client. Transport
//! retry policy (connection flaps etc.) belongs to the transport, not the
//! callers.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::{Error, Result, Server};

/// Outcome of one command on one server
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote execution capability
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a shell command on a server, capturing both streams.
    ///
    /// A non-zero exit lands in `CommandOutput::exit_code`; `Err` is reserved
    /// for transport failures (connection refused, spawn failure, ...).
    async fn run(&self, server: &Server, command: &str) -> Result<CommandOutput>;
}

/// Transport that shells out to the system `ssh` client.
///
/// Targets named `localhost` or `127.0.0.1` are run directly through
/// `sh -c` without a connection.
pub struct SshTransport {
    ssh_key_path: Option<String>,
}

impl SshTransport {
    pub fn new(ssh_key_path: Option<String>) -> Self {
        Self { ssh_key_path }
    }

    fn is_local(server: &Server) -> bool {
        matches!(server.name(), "localhost" | "127.0.0.1")
    }

    async fn run_local(&self, command: &str) -> Result<CommandOutput> {
        debug!(command = %command, "Executing locally");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::RemoteExecutionError(format!("failed to execute: {}", e)))?;

        Ok(convert(output))
    }

    async fn run_remote(&self, server: &Server, command: &str) -> Result<CommandOutput> {
        debug!(server = %server, command = %command, "Executing remotely via SSH");

        let mut ssh_cmd = tokio::process::Command::new("ssh");
        ssh_cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        ssh_cmd.arg("-o").arg("BatchMode=yes");

        if let Some(key_path) = &self.ssh_key_path {
            ssh_cmd.arg("-i").arg(key_path);
        }
        if let Some(port) = server.port() {
            ssh_cmd.arg("-p").arg(port.to_string());
        }

        ssh_cmd.arg(server.name()).arg(command);

        let output = ssh_cmd
            .output()
            .await
            .map_err(|e| Error::RemoteExecutionError(format!("ssh failed: {}", e)))?;

        // ssh exits 255 on connection-level failure; everything else is the
        // remote command's own status.
        if output.status.code() == Some(255) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::RemoteExecutionError(format!(
                "ssh connection to {} failed: {}",
                server,
                stderr.trim()
            )));
        }

        Ok(convert(output))
    }
}

fn convert(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

#[async_trait]
impl Transport for SshTransport {
    #[instrument(skip(self, command), fields(server = %server))]
    async fn run(&self, server: &Server, command: &str) -> Result<CommandOutput> {
        if Self::is_local(server) {
            self.run_local(command).await
        } else {
            self.run_remote(server, command).await
        }
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted transport for engine tests

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    /// One scripted response for a server
    pub(crate) enum Scripted {
        /// (exit_code, stdout, stderr)
        Output(i32, &'static str, &'static str),
        /// Transport-level failure
        TransportError(&'static str),
        /// Never completes; exercises step timeouts
        Hang,
    }

    /// Transport that replays scripted responses and understands the
    /// per-host lock protocol.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
        pub(crate) log: Mutex<Vec<(String, String)>>,
        /// Servers that refuse the host lock
        pub(crate) lock_denied: Mutex<Vec<String>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn script(&self, server: &str, responses: Vec<Scripted>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(server.to_string(), responses.into());
        }

        pub(crate) fn deny_lock(&self, server: &str) {
            self.lock_denied.lock().unwrap().push(server.to_string());
        }

        /// Commands issued to a given server, in order
        pub(crate) fn commands_for(&self, server: &str) -> Vec<String> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == server)
                .map(|(_, c)| c.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn run(&self, server: &Server, command: &str) -> Result<CommandOutput> {
            self.log
                .lock()
                .unwrap()
                .push((server.name().to_string(), command.to_string()));

            // Host lock protocol
            if command.contains("set -C") {
                let denied = self
                    .lock_denied
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|s| s == server.name());
                let stdout = if denied {
                    // An existing, fresh marker
                    format!(
                        "{{\"holder\":\"other:999\",\"pid\":999,\"acquired_at\":{}}}\n",
                        chrono::Utc::now().timestamp()
                    )
                } else {
                    "LOCKED\n".to_string()
                };
                return Ok(CommandOutput {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                });
            }
            if command.starts_with("rm -f ") {
                return Ok(CommandOutput::default());
            }

            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(server.name())
                .and_then(VecDeque::pop_front);

            match scripted {
                Some(Scripted::Output(exit_code, stdout, stderr)) => Ok(CommandOutput {
                    exit_code,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                }),
                Some(Scripted::TransportError(msg)) => {
                    Err(Error::RemoteExecutionError(msg.to_string()))
                }
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(86_400)).await;
                    unreachable!("hung command completed")
                }
                None => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: "ok\n".to_string(),
                    stderr: String::new(),
                }),
            }
        }
    }
}
