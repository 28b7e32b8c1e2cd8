//! # sandbench-core
//!
//! Backend-agnostic sandbox layer for benchmarking isolation backends.
//!
//! Containers, micro-VMs and full VMs are all driven through the same
//! lifecycle and exec contract, so a workload can be started, commanded,
//! measured and torn down the same way whichever backend runs it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │  providers: [docker, firecracker, qemu, ...]  (ordered)      │
//! │  registry:  id ─▶ Arc<Sandbox>      ports: 2222, 2223, ...   │
//! │  mounts:    {base_dir}/{id}/workspace                        │
//! └───────────────┬──────────────────────────────────────────────┘
//!                 │ create(LaunchSpec)
//!                 ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │     SandboxProvider      │─────▶│         Sandbox          │
//! │  is_available / info     │      │  exec / exec_streaming   │
//! └──────────────────────────┘      │  ssh_exec / stop         │
//!                                   │  metrics (running avg)   │
//!                                   └──────┬────────────┬──────┘
//!                                          │            │
//!                          Box<dyn SandboxBackend>   Arc<ConnectionClient>
//!                          (framed exec stream ──▶   (ssh ControlMaster,
//!                           StreamDemultiplexer)      RetryPolicy)
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use sandbench_core::{ExecRequest, Orchestrator, OrchestratorConfig, SandboxConfig, SandboxUser};
//! use std::sync::Arc;
//!
//! # async fn example() -> sandbench_core::Result<()> {
//! let mut orchestrator = Orchestrator::new(OrchestratorConfig::new("/tmp/sandbench"));
//! orchestrator.register_provider(Arc::new(DockerProvider::default()));
//!
//! let config = SandboxConfig::builder("bench-0", "alpine:3.20")
//!     .user(SandboxUser::new("agent"))
//!     .build()?;
//! let sandbox = orchestrator.create_sandbox("docker", config).await?;
//!
//! let result = sandbox.exec(ExecRequest::new("echo").arg("hi")).await?;
//! assert_eq!(result.stdout, "hi\n");
//!
//! orchestrator.stop_sandbox("bench-0").await;
//! orchestrator.cleanup_mount("bench-0").await?;
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod config;
mod connection;
mod demux;
mod error;
mod exec;
mod orchestrator;
mod provider;
mod retry;
mod sandbox;
mod stats;

pub use bootstrap::{detect_tools, setup_user, UserTools};
pub use config::{SandboxConfig, SandboxConfigBuilder, SandboxUser, DEFAULT_MOUNT_TARGET};
pub use connection::{
    wait_for_connection, wait_for_connection_with, ConnectionClient, ConnectionConfig, Connector,
    RemoteSession, SshConnector,
};
pub use demux::{demux, encode_frame, OutputChunk, StreamDemultiplexer, StreamKind};
pub use error::{CoreError, DecodeError, Result};
pub use exec::{
    remote_command_line, run_bounded, shell_quote, ExecOutput, ExecRequest, ExecResult, Identity,
    SYNTHETIC_EXIT_CODE,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use provider::{IsolationType, LaunchSpec, ProviderInfo, SandboxProvider};
pub use retry::{RetryError, RetryPolicy};
pub use sandbox::{forward_output, Sandbox, SandboxBackend, SandboxMetrics, SandboxState};
pub use stats::{percentile, running_average, Summary};

// Re-exported so providers and callers share one token type.
pub use tokio_util::sync::CancellationToken;
