//! Micro-VM backend on Firecracker.
//!
//! Per sandbox: a /30 TAP network, a private copy of the root filesystem,
//! a Firecracker VM booted with kernel IP autoconfiguration, and a local
//! forwarder from `127.0.0.1:{ssh_port}` to the guest's sshd. Commands go
//! over SSH.

use crate::forward::PortForwarder;
use crate::ssh::{exec_over, SshSettings};
use async_trait::async_trait;
use sandbench_core::{
    ConnectionClient, CoreError, ExecOutput, ExecRequest, IsolationType, LaunchSpec, OutputChunk,
    ProviderInfo, Result, Sandbox, SandboxBackend, SandboxProvider,
};
use sandbench_vm::{setup_tap, teardown_tap, NetworkAllocator, VirtualMachine, VmBuilder};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

pub const FIRECRACKER: &str = "firecracker";

const KVM_DEVICE: &str = "/dev/kvm";

#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    pub firecracker_path: PathBuf,
    pub kernel_path: PathBuf,
    /// Root filesystem used when the sandbox image does not name one.
    pub rootfs_path: PathBuf,
    /// VM sockets and per-sandbox root filesystem copies.
    pub work_dir: PathBuf,
    /// TAP devices are named `{tap_prefix}{index}`.
    pub tap_prefix: String,
    pub default_vcpus: u8,
    pub default_memory_mib: u32,
    pub ssh: SshSettings,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/sandbench/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/sandbench/rootfs.ext4"),
            work_dir: std::env::temp_dir().join("sandbench").join("firecracker"),
            tap_prefix: "sbtap".into(),
            default_vcpus: 1,
            default_memory_mib: 256,
            ssh: SshSettings::default(),
        }
    }
}

/// Firecracker provider.
pub struct FirecrackerProvider {
    config: FirecrackerConfig,
    networks: NetworkAllocator,
}

impl Default for FirecrackerProvider {
    fn default() -> Self {
        Self::new(FirecrackerConfig::default())
    }
}

impl FirecrackerProvider {
    pub fn new(config: FirecrackerConfig) -> Self {
        Self {
            networks: NetworkAllocator::new(config.tap_prefix.clone()),
            config,
        }
    }

    pub fn config(&self) -> &FirecrackerConfig {
        &self.config
    }

    /// Root filesystem for `image`: the image itself when it is a file on
    /// the host, the configured default otherwise.
    async fn base_rootfs(&self, image: &str) -> PathBuf {
        let candidate = Path::new(image);
        if !image.is_empty() && tokio::fs::metadata(candidate).await.is_ok_and(|m| m.is_file()) {
            candidate.to_path_buf()
        } else {
            self.config.rootfs_path.clone()
        }
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        backend: &mut FirecrackerBackend,
    ) -> Result<(Arc<ConnectionClient>, Duration)> {
        let vcpus = match spec.cpus {
            Some(cpus) => u8::try_from(cpus)
                .map_err(|_| CoreError::CreateFailed(format!("too many vcpus: {cpus}")))?,
            None => self.config.default_vcpus,
        };
        let memory_mib = spec.memory_mib.unwrap_or(self.config.default_memory_mib);

        let network = self.networks.allocate(&spec.id).map_err(create_failed)?;
        backend.tap = Some(network.tap_name.clone());
        setup_tap(&network).await.map_err(create_failed)?;

        let sandbox_dir = self.config.work_dir.join(&spec.id);
        tokio::fs::create_dir_all(&sandbox_dir).await?;
        backend.sandbox_dir = Some(sandbox_dir.clone());

        let base = self.base_rootfs(&spec.image).await;
        let rootfs = sandbox_dir.join("rootfs.ext4");
        tokio::fs::copy(&base, &rootfs).await.map_err(|e| {
            CoreError::CreateFailed(format!("failed to copy rootfs {}: {e}", base.display()))
        })?;
        tracing::debug!(sandbox_id = %spec.id, rootfs = %base.display(), "Root filesystem copied");

        let guest = SocketAddr::from((network.guest_ip, 22));

        let vm = VmBuilder::new()
            .vcpus(vcpus)
            .memory_mib(memory_mib)
            .kernel(&self.config.kernel_path)
            .rootfs(&rootfs)
            .firecracker_binary(&self.config.firecracker_path)
            .work_dir(&self.config.work_dir)
            .network(network)
            .boot()
            .await
            .map_err(create_failed)?;
        backend.memory_bytes = vm.memory_bytes();
        *backend.vm.get_mut() = Some(vm);

        let listen = SocketAddr::from(([127, 0, 0, 1], spec.ssh_port));
        let forwarder = PortForwarder::start(listen, guest).await.map_err(|e| {
            CoreError::CreateFailed(format!("failed to forward {listen} to {guest}: {e}"))
        })?;
        backend.forwarder = Some(forwarder);

        let (client, ready) = self.config.ssh.connect_local(spec.ssh_port).await?;
        backend.client = Some(client.clone());
        Ok((client, ready))
    }
}

fn create_failed(e: sandbench_vm::VmError) -> CoreError {
    CoreError::CreateFailed(e.to_string())
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[async_trait]
impl SandboxProvider for FirecrackerProvider {
    fn name(&self) -> &str {
        FIRECRACKER
    }

    async fn is_available(&self) -> bool {
        for path in [
            Path::new(KVM_DEVICE),
            self.config.firecracker_path.as_path(),
            self.config.kernel_path.as_path(),
        ] {
            if !path_exists(path).await {
                tracing::debug!(path = %path.display(), "Firecracker prerequisite missing");
                return false;
            }
        }
        true
    }

    async fn info(&self) -> ProviderInfo {
        let version = match Command::new(&self.config.firecracker_path)
            .arg("--version")
            .output()
            .await
        {
            Ok(out) if out.status.success() => parse_version(&String::from_utf8_lossy(&out.stdout)),
            _ => "unknown".into(),
        };
        ProviderInfo::new(FIRECRACKER, version, IsolationType::MicroVm)
            .with_feature("ssh-exec")
            .with_feature("tap-network")
            .with_feature("port-forward")
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<Sandbox> {
        let mut backend = FirecrackerBackend::new(&spec.id);
        match self.launch(spec, &mut backend).await {
            Ok((client, ready)) => {
                tracing::info!(
                    sandbox_id = %spec.id,
                    ssh_port = spec.ssh_port,
                    ready_ms = ready.as_millis() as u64,
                    "Micro-VM ready"
                );
                Ok(Sandbox::new(spec, FIRECRACKER, Box::new(backend)).with_connection(client, ready))
            }
            Err(e) => {
                tracing::error!(sandbox_id = %spec.id, error = %e, "Micro-VM launch failed");
                backend.release().await;
                Err(e)
            }
        }
    }
}

/// `Firecracker v1.7.0` -> `1.7.0`.
fn parse_version(output: &str) -> String {
    output
        .lines()
        .next()
        .map(|line| line.trim().trim_start_matches("Firecracker").trim().trim_start_matches('v'))
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Everything one micro-VM sandbox holds. Fields fill in as the launch
/// progresses, so a partial launch releases exactly what it acquired.
struct FirecrackerBackend {
    sandbox_id: String,
    tap: Option<String>,
    sandbox_dir: Option<PathBuf>,
    vm: Mutex<Option<VirtualMachine>>,
    memory_bytes: u64,
    forwarder: Option<PortForwarder>,
    client: Option<Arc<ConnectionClient>>,
}

impl FirecrackerBackend {
    fn new(sandbox_id: &str) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            tap: None,
            sandbox_dir: None,
            vm: Mutex::new(None),
            memory_bytes: 0,
            forwarder: None,
            client: None,
        }
    }

    /// Tear down in reverse launch order. Safe to call more than once.
    async fn release(&self) {
        if let Some(client) = &self.client {
            client.disconnect().await;
        }
        if let Some(forwarder) = &self.forwarder {
            forwarder.stop().await;
        }
        if let Some(vm) = self.vm.lock().await.take() {
            if let Err(e) = vm.destroy().await {
                tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "VM destroy failed");
            }
        }
        if let Some(tap) = &self.tap {
            teardown_tap(tap).await;
        }
        if let Some(dir) = &self.sandbox_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to remove VM files");
                }
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for FirecrackerBackend {
    async fn exec(
        &self,
        request: &ExecRequest,
        output: Option<&mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutput> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| CoreError::ExecTransportFailed("guest not connected".into()))?;
        exec_over(client, request, output).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.release().await;
        tracing::debug!(sandbox_id = %self.sandbox_id, "Micro-VM released");
        Ok(())
    }

    async fn memory_bytes(&self) -> Option<u64> {
        (self.memory_bytes > 0).then_some(self.memory_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("Firecracker v1.7.0\n\nSupported snapshot data format versions: 1.0.0\n"), "1.7.0");
        assert_eq!(parse_version(""), "unknown");
    }

    #[tokio::test]
    async fn test_unavailable_without_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FirecrackerProvider::new(FirecrackerConfig {
            firecracker_path: dir.path().join("firecracker"),
            kernel_path: dir.path().join("vmlinux"),
            ..Default::default()
        });
        assert!(!provider.is_available().await);
        assert_eq!(provider.info().await.version, "unknown");
    }

    #[tokio::test]
    async fn test_base_rootfs_prefers_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("custom.ext4");
        std::fs::write(&image, b"").unwrap();
        let provider = FirecrackerProvider::default();

        assert_eq!(provider.base_rootfs(&image.to_string_lossy()).await, image);
        assert_eq!(
            provider.base_rootfs("alpine:3.20").await,
            provider.config().rootfs_path
        );
    }

    #[tokio::test]
    async fn test_release_of_empty_backend_is_noop() {
        let backend = FirecrackerBackend::new("sb-1");
        backend.shutdown().await.unwrap();
        backend.shutdown().await.unwrap();
        assert_eq!(backend.memory_bytes().await, None);

        let err = backend.exec(&ExecRequest::new("true"), None).await.unwrap_err();
        assert!(matches!(err, CoreError::ExecTransportFailed(_)));
    }
}
