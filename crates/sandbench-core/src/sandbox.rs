//! Sandbox type - one running isolated instance.

use crate::config::SandboxUser;
use crate::connection::ConnectionClient;
use crate::demux::{OutputChunk, StreamKind};
use crate::error::{CoreError, Result};
use crate::exec::{remote_command_line, run_bounded, ExecOutput, ExecRequest, ExecResult, Identity};
use crate::provider::LaunchSpec;
use crate::stats::running_average;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};

/// Backend-specific half of a sandbox.
///
/// Providers implement this for whatever process or API actually hosts the
/// instance. Requests arrive with their identity already resolved.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Run one command and collect its output.
    ///
    /// When `output` is given, decoded fragments are sent on it as they
    /// become available. Malformed output must surface as
    /// [`CoreError::Decode`].
    async fn exec(
        &self,
        request: &ExecRequest,
        output: Option<&mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutput>;

    /// Release every resource behind the instance.
    ///
    /// Called once per completed stop. A call whose future was dropped
    /// is retried by the next stop, so this must tolerate a partial release.
    async fn shutdown(&self) -> Result<()>;

    /// Current memory footprint, if the backend can measure it.
    async fn memory_bytes(&self) -> Option<u64> {
        None
    }
}

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Started, no command has succeeded yet.
    Created,
    /// At least one command has completed.
    Running,
    /// Terminal.
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Performance facts about one sandbox, in milliseconds and bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub startup_ms: f64,
    pub connection_ready_ms: Option<f64>,
    /// Running average over successful commands.
    pub exec_latency_ms: Option<f64>,
    pub exec_samples: u64,
    pub memory_bytes: Option<u64>,
}

impl SandboxMetrics {
    fn record_exec(&mut self, latency_ms: f64) {
        self.exec_latency_ms = Some(running_average(self.exec_latency_ms, latency_ms));
        self.exec_samples += 1;
    }
}

/// A running sandbox.
///
/// Commands on one sandbox are not serialized, and `stop` does not wait
/// for commands still in flight.
pub struct Sandbox {
    id: String,
    provider: String,
    ssh_port: u16,
    mount_path: PathBuf,
    mount_target: String,
    env: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
    state: Mutex<SandboxState>,
    metrics: Mutex<SandboxMetrics>,
    user: RwLock<Option<SandboxUser>>,
    connection: Option<Arc<ConnectionClient>>,
    backend: Box<dyn SandboxBackend>,
    /// Set once the connection and backend have been released.
    released: OnceCell<()>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("ssh_port", &self.ssh_port)
            .field("mount_path", &self.mount_path)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Wrap a started backend.
    pub fn new(spec: &LaunchSpec, provider: impl Into<String>, backend: Box<dyn SandboxBackend>) -> Self {
        Self {
            id: spec.id.clone(),
            provider: provider.into(),
            ssh_port: spec.ssh_port,
            mount_path: spec.mount_path.clone(),
            mount_target: spec.mount_target.clone(),
            env: spec.env.clone(),
            created_at: Utc::now(),
            state: Mutex::new(SandboxState::Created),
            metrics: Mutex::new(SandboxMetrics::default()),
            user: RwLock::new(None),
            connection: None,
            backend,
            released: OnceCell::new(),
        }
    }

    /// Attach the remote channel used by [`ssh_exec`](Self::ssh_exec).
    ///
    /// `ready_after` is how long the channel took to come up.
    pub fn with_connection(mut self, client: Arc<ConnectionClient>, ready_after: Duration) -> Self {
        self.connection = Some(client);
        self.metrics.get_mut().connection_ready_ms = Some(ms(ready_after));
        self
    }

    /// Record the time from request to a usable instance.
    pub fn set_startup(&mut self, elapsed: Duration) {
        self.metrics.get_mut().startup_ms = ms(elapsed);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the provider that created this sandbox.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Guest path of the shared mount.
    pub fn mount_target(&self) -> &str {
        &self.mount_target
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn state(&self) -> SandboxState {
        *self.state.lock().await
    }

    pub async fn metrics(&self) -> SandboxMetrics {
        self.metrics.lock().await.clone()
    }

    /// The installed non-root user, if any.
    pub async fn user(&self) -> Option<SandboxUser> {
        self.user.read().await.clone()
    }

    /// Make `user` the identity for [`Identity::Default`] requests.
    pub async fn install_user(&self, user: SandboxUser) {
        tracing::debug!(sandbox_id = %self.id, user = %user.name, uid = user.uid, "User installed");
        *self.user.write().await = Some(user);
    }

    /// Run a command through the backend.
    ///
    /// # Errors
    /// Only [`CoreError::Decode`]. Every other failure, including a stopped
    /// sandbox, a timeout or cancellation, comes back as an [`ExecResult`]
    /// with exit code -1 and the reason in `stderr`.
    pub async fn exec(&self, request: ExecRequest) -> Result<ExecResult> {
        self.exec_inner(request, None).await
    }

    /// Like [`exec`](Self::exec), additionally sending each decoded
    /// fragment on `output` as it arrives.
    pub async fn exec_streaming(
        &self,
        request: ExecRequest,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<ExecResult> {
        self.exec_inner(request, Some(&output)).await
    }

    async fn exec_inner(
        &self,
        request: ExecRequest,
        output: Option<&mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecResult> {
        let start = Instant::now();
        if self.state().await == SandboxState::Stopped {
            return Ok(ExecResult::failed("sandbox is stopped", start));
        }
        if request.command.is_empty() {
            return Ok(ExecResult::failed("empty command", start));
        }

        let request = self.resolve(request).await;
        tracing::debug!(
            sandbox_id = %self.id,
            program = %request.program(),
            identity = ?request.identity,
            "Executing command"
        );

        let outcome = run_bounded(
            self.backend.exec(&request, output),
            request.timeout,
            request.cancel.as_ref(),
        )
        .await;
        self.finish(outcome, start).await
    }

    /// Run a command over the attached remote channel.
    ///
    /// Same error contract as [`exec`](Self::exec). Output is delivered once
    /// the command has finished.
    pub async fn ssh_exec(&self, request: ExecRequest) -> Result<ExecResult> {
        let start = Instant::now();
        if self.state().await == SandboxState::Stopped {
            return Ok(ExecResult::failed("sandbox is stopped", start));
        }
        let Some(client) = &self.connection else {
            return Ok(ExecResult::failed("no remote channel attached", start));
        };
        if request.command.is_empty() {
            return Ok(ExecResult::failed("empty command", start));
        }

        let request = self.resolve(request).await;
        let line = remote_command_line(&request);
        tracing::debug!(sandbox_id = %self.id, command = %line, "Executing over remote channel");

        let outcome = run_bounded(
            client.exec_output(&line),
            request.timeout,
            request.cancel.as_ref(),
        )
        .await;
        self.finish(outcome, start).await
    }

    async fn finish(&self, outcome: Result<ExecOutput>, start: Instant) -> Result<ExecResult> {
        match outcome {
            Ok(output) => {
                let elapsed = start.elapsed();
                self.metrics.lock().await.record_exec(ms(elapsed));
                {
                    let mut state = self.state.lock().await;
                    if *state == SandboxState::Created {
                        *state = SandboxState::Running;
                    }
                }
                let result = ExecResult::from_output(output, elapsed);
                tracing::debug!(
                    sandbox_id = %self.id,
                    exit_code = result.exit_code,
                    elapsed_ms = result.duration_ms,
                    "Command completed"
                );
                Ok(result)
            }
            Err(CoreError::Decode(e)) => {
                tracing::warn!(sandbox_id = %self.id, error = %e, "Malformed exec stream");
                Err(CoreError::Decode(e))
            }
            Err(e) => {
                tracing::debug!(sandbox_id = %self.id, error = %e, "Command failed");
                Ok(ExecResult::failed(e.to_string(), start))
            }
        }
    }

    /// Resolve the default identity and apply sandbox-wide environment.
    async fn resolve(&self, mut request: ExecRequest) -> ExecRequest {
        for (key, value) in &self.env {
            request.env.entry(key.clone()).or_insert_with(|| value.clone());
        }

        if request.identity != Identity::Default {
            return request;
        }
        let user = self.user.read().await;
        match user.as_ref() {
            Some(user) => {
                request.identity = Identity::User {
                    uid: user.uid,
                    gid: user.gid,
                };
                request.env.entry("HOME".into()).or_insert_with(|| user.home.clone());
                request.env.entry("USER".into()).or_insert_with(|| user.name.clone());
                request.env.entry("LOGNAME".into()).or_insert_with(|| user.name.clone());
                if request.workdir.is_none() {
                    request.workdir = Some(self.mount_target.clone());
                }
            }
            None => request.identity = Identity::Root,
        }
        request
    }

    /// Refresh backend-measured metrics and return a snapshot.
    pub async fn update_stats(&self) -> SandboxMetrics {
        let memory = self.backend.memory_bytes().await;
        let mut metrics = self.metrics.lock().await;
        if memory.is_some() {
            metrics.memory_bytes = memory;
        }
        metrics.clone()
    }

    /// Stop the sandbox and release the backend.
    ///
    /// Idempotent. Concurrent callers wait for the first one, and the
    /// backend is shut down exactly once. Dropping the future before it
    /// completes leaves the release to the next call. Failures are
    /// logged, not returned.
    pub async fn stop(&self) {
        *self.state.lock().await = SandboxState::Stopped;
        if self.released.initialized() {
            tracing::debug!(sandbox_id = %self.id, "Sandbox already stopped");
            return;
        }
        self.released.get_or_init(|| self.release()).await;
    }

    async fn release(&self) {
        let start = Instant::now();
        tracing::info!(sandbox_id = %self.id, provider = %self.provider, "Stopping sandbox");

        if let Some(client) = &self.connection {
            client.disconnect().await;
        }
        if let Err(e) = self.backend.shutdown().await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Backend shutdown failed");
        }

        tracing::info!(
            sandbox_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox stopped"
        );
    }
}

/// Deliver already-collected output as chunks, stdout first.
///
/// For backends whose transport separates the streams itself.
pub fn forward_output(output: &ExecOutput, sink: Option<&mpsc::UnboundedSender<OutputChunk>>) {
    let Some(sink) = sink else {
        return;
    };
    for (stream, data) in [
        (StreamKind::Stdout, &output.stdout),
        (StreamKind::Stderr, &output.stderr),
    ] {
        if !data.is_empty() {
            let _ = sink.send(OutputChunk {
                stream,
                data: Bytes::copy_from_slice(data),
            });
        }
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
