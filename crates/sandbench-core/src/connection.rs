//! Remote command channel into a sandbox.
//!
//! The default transport is OpenSSH in ControlMaster mode: one long-lived
//! master process per connection, with every command multiplexed as a new
//! session over its control socket. Transports sit behind [`Connector`] and
//! [`RemoteSession`] so they can be replaced in tests.

use crate::error::{CoreError, Result};
use crate::exec::{ExecOutput, ExecResult};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};

/// Interval between readiness checks while the SSH master comes up.
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key. Falls back to the ssh client's own defaults when `None`.
    pub identity_file: Option<PathBuf>,
    /// Upper bound for one connection attempt.
    pub connect_timeout: Duration,
    /// Directory for ControlMaster sockets.
    pub control_dir: PathBuf,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 22,
            user: "root".into(),
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
            control_dir: std::env::temp_dir(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `user@host` as the ssh client expects it.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Establishes sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Launch a session and wait until it accepts commands.
    ///
    /// Implementations must release everything they started when this fails.
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn RemoteSession>>;
}

/// An established channel that runs one shell command per call.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` in the remote login shell and collect its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Tear down the session.
    ///
    /// May run while calls to [`exec`](Self::exec) are still in flight;
    /// those should then fail rather than block the close.
    async fn close(&self) -> Result<()>;
}

/// Retried, timed-out remote command channel.
pub struct ConnectionClient {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    session: RwLock<Option<Arc<dyn RemoteSession>>>,
}

impl std::fmt::Debug for ConnectionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionClient {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            session: RwLock::new(None),
        }
    }

    /// Client over the OpenSSH transport.
    pub fn ssh(config: ConnectionConfig) -> Self {
        Self::new(config, Arc::new(SshConnector))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Open the session, bounded by `connect_timeout`.
    ///
    /// A previous session is closed first.
    pub async fn connect(&self) -> Result<()> {
        let start = Instant::now();
        let mut slot = self.session.write().await;
        if let Some(old) = slot.take() {
            if let Err(e) = old.close().await {
                tracing::warn!(error = %e, "Closing previous session failed");
            }
        }

        let limit = self.config.connect_timeout;
        let session = match tokio::time::timeout(limit, self.connector.open(&self.config)).await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CoreError::ConnectTimeout {
                    attempts: 1,
                    message: format!("no session within {} ms", limit.as_millis()),
                })
            }
        };

        tracing::debug!(
            host = %self.config.host,
            port = self.config.port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Session established"
        );
        *slot = Some(Arc::from(session));
        Ok(())
    }

    /// Run one command and time it.
    ///
    /// # Errors
    /// [`CoreError::ExecTransportFailed`] when not connected or the
    /// transport fails. A non-zero exit status is not an error.
    pub async fn exec(&self, command: &str) -> Result<ExecResult> {
        let start = Instant::now();
        let output = self.exec_output(command).await?;
        Ok(ExecResult::from_output(output, start.elapsed()))
    }

    /// Like [`exec`](Self::exec) but returns raw bytes.
    pub async fn exec_output(&self, command: &str) -> Result<ExecOutput> {
        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| CoreError::ExecTransportFailed("not connected".into()))?;
        tracing::trace!(command = %command, "Remote exec");
        session.exec(command).await
    }

    /// Close the session. Calling this on a closed client is a no-op.
    ///
    /// Does not wait for in-flight commands.
    pub async fn disconnect(&self) {
        let taken = self.session.write().await.take();
        if let Some(session) = taken {
            if let Err(e) = session.close().await {
                tracing::warn!(host = %self.config.host, error = %e, "Session close failed");
            }
            tracing::debug!(host = %self.config.host, port = self.config.port, "Disconnected");
        }
    }
}

/// Connect with retries.
///
/// Each failed attempt has already disposed of its session. When every
/// attempt fails the error names the attempt count and the last failure.
pub async fn wait_for_connection(
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<ConnectionClient> {
    wait_for_connection_with(config, connector, &RetryPolicy::new(max_retries, retry_delay)).await
}

/// [`wait_for_connection`] with a full retry policy.
pub async fn wait_for_connection_with(
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    policy: &RetryPolicy,
) -> Result<ConnectionClient> {
    let start = Instant::now();
    let client = ConnectionClient::new(config, connector);

    match policy.run(|_| client.connect()).await {
        Ok(()) => {
            tracing::info!(
                host = %client.config.host,
                port = client.config.port,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Connection ready"
            );
            Ok(client)
        }
        Err(e) => {
            tracing::warn!(
                host = %client.config.host,
                port = client.config.port,
                attempts = e.attempts,
                error = %e.last,
                "Connection never became ready"
            );
            let message = match e.last {
                CoreError::ConnectTimeout { message, .. } => message,
                other => other.to_string(),
            };
            Err(CoreError::ConnectTimeout {
                attempts: e.attempts,
                message,
            })
        }
    }
}

/// OpenSSH ControlMaster transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

fn ssh_options(config: &ConnectionConfig) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        config.port.to_string(),
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-o".into(),
        format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)),
    ];
    if let Some(key) = &config.identity_file {
        args.push("-i".into());
        args.push(key.to_string_lossy().into_owned());
    }
    args
}

/// Removes the control socket when the session goes away, however it goes.
#[derive(Debug)]
struct ControlSocket(PathBuf);

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn RemoteSession>> {
        let socket = ControlSocket(
            config
                .control_dir
                .join(format!("sb-{}.sock", uuid::Uuid::new_v4().simple())),
        );
        let options = ssh_options(config);
        let destination = config.destination();

        let mut master = Command::new("ssh")
            .arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&socket.0)
            .args(["-o", "ControlPersist=no"])
            .args(&options)
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::ExecTransportFailed(format!("failed to spawn ssh: {e}")))?;

        loop {
            if let Some(status) = master.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(CoreError::ExecTransportFailed(format!(
                    "ssh master exited with {status}: {}",
                    stderr.trim()
                )));
            }

            if control_check(&socket.0, &options, &destination).await {
                break;
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }

        Ok(Box::new(SshSession {
            master: Mutex::new(master),
            socket,
            options,
            destination,
        }))
    }
}

async fn control_check(socket: &Path, options: &[String], destination: &str) -> bool {
    if !socket.exists() {
        return false;
    }
    Command::new("ssh")
        .arg("-S")
        .arg(socket)
        .args(["-O", "check"])
        .args(options)
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

struct SshSession {
    master: Mutex<Child>,
    socket: ControlSocket,
    options: Vec<String>,
    destination: String,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let output = Command::new("ssh")
            .arg("-S")
            .arg(&self.socket.0)
            .args(&self.options)
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CoreError::ExecTransportFailed(format!("ssh exec failed: {e}")))?;

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn close(&self) -> Result<()> {
        let _ = Command::new("ssh")
            .arg("-S")
            .arg(&self.socket.0)
            .args(["-O", "exit"])
            .args(&self.options)
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        let mut master = self.master.lock().await;
        if master.try_wait()?.is_none() {
            master.kill().await?;
        }
        let _ = tokio::fs::remove_file(&self.socket.0).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` opens, then hands out echo sessions.
    struct FlakyConnector {
        failures: u32,
        opens: AtomicU32,
        closes: Arc<AtomicU32>,
    }

    struct EchoSession {
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RemoteSession for EchoSession {
        async fn exec(&self, command: &str) -> Result<ExecOutput> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: command.as_bytes().to_vec(),
                stderr: Vec::new(),
            })
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn open(&self, _config: &ConnectionConfig) -> Result<Box<dyn RemoteSession>> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(CoreError::ExecTransportFailed("connection refused".into()));
            }
            Ok(Box::new(EchoSession {
                closes: self.closes.clone(),
            }))
        }
    }

    fn flaky(failures: u32) -> (Arc<FlakyConnector>, Arc<AtomicU32>) {
        let closes = Arc::new(AtomicU32::new(0));
        let connector = Arc::new(FlakyConnector {
            failures,
            opens: AtomicU32::new(0),
            closes: closes.clone(),
        });
        (connector, closes)
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connection_retries() {
        let (connector, _) = flaky(2);
        let client = wait_for_connection(
            ConnectionConfig::default(),
            connector.clone(),
            5,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert!(client.is_connected().await);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 3);

        let result = client.exec("echo hi").await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "echo hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connection_exhausted() {
        let (connector, _) = flaky(u32::MAX);
        let err = wait_for_connection(
            ConnectionConfig::default(),
            connector,
            3,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();

        match err {
            CoreError::ConnectTimeout { attempts, message } => {
                assert_eq!(attempts, 4);
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        struct HangingConnector;

        #[async_trait]
        impl Connector for HangingConnector {
            async fn open(&self, _config: &ConnectionConfig) -> Result<Box<dyn RemoteSession>> {
                std::future::pending().await
            }
        }

        let config = ConnectionConfig {
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let client = ConnectionClient::new(config, Arc::new(HangingConnector));

        assert!(matches!(
            client.connect().await,
            Err(CoreError::ConnectTimeout { attempts: 1, .. })
        ));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_exec_without_connection() {
        let client = ConnectionClient::ssh(ConnectionConfig::default());
        assert!(matches!(
            client.exec("true").await,
            Err(CoreError::ExecTransportFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (connector, closes) = flaky(0);
        let client = ConnectionClient::new(ConnectionConfig::default(), connector);
        client.connect().await.unwrap();

        client.disconnect().await;
        client.disconnect().await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_disconnect_while_exec_in_flight() {
        struct StuckConnector {
            entered: Arc<tokio::sync::Notify>,
            closes: Arc<AtomicU32>,
        }

        struct StuckSession {
            entered: Arc<tokio::sync::Notify>,
            closes: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Connector for StuckConnector {
            async fn open(&self, _config: &ConnectionConfig) -> Result<Box<dyn RemoteSession>> {
                Ok(Box::new(StuckSession {
                    entered: self.entered.clone(),
                    closes: self.closes.clone(),
                }))
            }
        }

        #[async_trait]
        impl RemoteSession for StuckSession {
            async fn exec(&self, _command: &str) -> Result<ExecOutput> {
                self.entered.notify_one();
                std::future::pending().await
            }

            async fn close(&self) -> Result<()> {
                self.closes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let entered = Arc::new(tokio::sync::Notify::new());
        let closes = Arc::new(AtomicU32::new(0));
        let client = Arc::new(ConnectionClient::new(
            ConnectionConfig::default(),
            Arc::new(StuckConnector {
                entered: entered.clone(),
                closes: closes.clone(),
            }),
        ));
        client.connect().await.unwrap();

        let running = tokio::spawn({
            let client = client.clone();
            async move { client.exec("sleep inf").await }
        });
        entered.notified().await;

        tokio::time::timeout(Duration::from_secs(2), client.disconnect())
            .await
            .expect("disconnect waited for the running command");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!client.is_connected().await);
        running.abort();
    }

    #[test]
    fn test_ssh_options() {
        let config = ConnectionConfig {
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
            port: 2222,
            ..Default::default()
        };
        let opts = ssh_options(&config);

        assert_eq!(&opts[..2], &["-p", "2222"]);
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert_eq!(&opts[opts.len() - 2..], &["-i", "/keys/id_ed25519"]);
        assert_eq!(config.destination(), "root@127.0.0.1");
    }
}
