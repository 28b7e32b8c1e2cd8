//! SSH settings and exec path shared by the VM backends.

use sandbench_core::{
    forward_output, remote_command_line, wait_for_connection_with, ConnectionClient,
    ConnectionConfig, ExecOutput, ExecRequest, OutputChunk, Result, RetryPolicy, SshConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How a VM backend reaches its guest's sshd.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    /// Bound on one connection attempt.
    pub connect_timeout: Duration,
    /// Schedule for waiting on the guest to boot.
    pub retry: RetryPolicy,
    /// Directory for ControlMaster sockets.
    pub control_dir: PathBuf,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".into(),
            identity_file: None,
            connect_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries: 60,
                initial_delay: Duration::from_millis(250),
                multiplier: 1.5,
                max_delay: Duration::from_secs(2),
            },
            control_dir: std::env::temp_dir(),
        }
    }
}

impl SshSettings {
    pub fn connection_config(&self, host: &str, port: u16) -> ConnectionConfig {
        ConnectionConfig {
            host: host.to_string(),
            port,
            user: self.user.clone(),
            identity_file: self.identity_file.clone(),
            connect_timeout: self.connect_timeout,
            control_dir: self.control_dir.clone(),
        }
    }

    /// Wait for sshd on `127.0.0.1:port` and return the client with the
    /// time it took to come up.
    pub async fn connect_local(&self, port: u16) -> Result<(Arc<ConnectionClient>, Duration)> {
        let start = Instant::now();
        let client = wait_for_connection_with(
            self.connection_config("127.0.0.1", port),
            Arc::new(SshConnector),
            &self.retry,
        )
        .await?;
        Ok((Arc::new(client), start.elapsed()))
    }
}

/// Run a request over an established SSH channel.
pub(crate) async fn exec_over(
    client: &ConnectionClient,
    request: &ExecRequest,
    output: Option<&mpsc::UnboundedSender<OutputChunk>>,
) -> Result<ExecOutput> {
    let line = remote_command_line(request);
    tracing::trace!(command = %line, "Remote command line");
    let collected = client.exec_output(&line).await?;
    forward_output(&collected, output);
    Ok(collected)
}
