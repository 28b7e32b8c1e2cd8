//! Full-VM backend on QEMU.
//!
//! Each sandbox boots a copy-on-write overlay of a base disk image with
//! user-mode networking forwarding `127.0.0.1:{ssh_port}` to the guest's
//! port 22. The host mount is exported over virtio-9p and mounted inside
//! the guest once SSH is up.

use crate::ssh::{exec_over, SshSettings};
use async_trait::async_trait;
use sandbench_core::{
    shell_quote, ConnectionClient, CoreError, ExecOutput, ExecRequest, IsolationType, LaunchSpec,
    OutputChunk, ProviderInfo, Result, Sandbox, SandboxBackend, SandboxProvider,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

pub const QEMU: &str = "qemu";

#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// `qemu-system-<arch>` for the host architecture by default.
    pub binary: PathBuf,
    pub qemu_img: PathBuf,
    /// Value of `accel=`; `kvm:tcg` falls back to emulation without KVM.
    pub accel: String,
    /// Base disk used when the sandbox image does not name one.
    pub image_path: PathBuf,
    pub image_format: String,
    /// Overlays and logs, one directory per sandbox.
    pub work_dir: PathBuf,
    /// 9p tag the guest mounts the workspace by.
    pub mount_tag: String,
    pub default_cpus: u32,
    pub default_memory_mib: u32,
    pub ssh: SshSettings,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(format!("qemu-system-{}", std::env::consts::ARCH)),
            qemu_img: PathBuf::from("qemu-img"),
            accel: "kvm:tcg".into(),
            image_path: PathBuf::from("/var/lib/sandbench/guest.qcow2"),
            image_format: "qcow2".into(),
            work_dir: std::env::temp_dir().join("sandbench").join("qemu"),
            mount_tag: "workspace".into(),
            default_cpus: 1,
            default_memory_mib: 512,
            ssh: SshSettings::default(),
        }
    }
}

/// QEMU option values are comma-separated; a literal comma is doubled.
fn qemu_escape(value: &str) -> String {
    value.replace(',', ",,")
}

fn machine_type() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" | "arm" => "virt",
        _ => "q35",
    }
}

impl QemuConfig {
    /// Command-line arguments for one guest.
    pub fn args(&self, spec: &LaunchSpec, overlay: &Path) -> Vec<String> {
        let cpus = spec.cpus.unwrap_or(self.default_cpus);
        let memory = spec.memory_mib.unwrap_or(self.default_memory_mib);
        vec![
            "-machine".into(),
            format!("{},accel={}", machine_type(), self.accel),
            "-cpu".into(),
            "max".into(),
            "-smp".into(),
            cpus.to_string(),
            "-m".into(),
            memory.to_string(),
            "-display".into(),
            "none".into(),
            "-serial".into(),
            "none".into(),
            "-monitor".into(),
            "none".into(),
            "-no-reboot".into(),
            "-drive".into(),
            format!(
                "file={},if=virtio,format=qcow2",
                qemu_escape(&overlay.to_string_lossy())
            ),
            "-netdev".into(),
            format!("user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22", spec.ssh_port),
            "-device".into(),
            "virtio-net-pci,netdev=net0".into(),
            "-virtfs".into(),
            format!(
                "local,path={},mount_tag={tag},security_model=mapped-xattr,id={tag}",
                qemu_escape(&spec.mount_path.to_string_lossy()),
                tag = self.mount_tag
            ),
        ]
    }

    /// Guest shell line mounting the 9p share at `target`.
    pub fn mount_command(&self, target: &str) -> String {
        let target = shell_quote(target);
        format!(
            "mkdir -p {target} && mount -t 9p -o trans=virtio,version=9p2000.L,msize=104857600 {} {target}",
            shell_quote(&self.mount_tag)
        )
    }
}

/// Resident set size in bytes from a `/proc/<pid>/status` body.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

/// `QEMU emulator version 8.2.2 (Debian ...)` -> `8.2.2`.
fn parse_version(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|l| l.split("version ").nth(1))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

async fn tool_version(binary: &Path) -> Option<String> {
    let out = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    parse_version(&String::from_utf8_lossy(&out.stdout))
}

/// QEMU provider.
#[derive(Default)]
pub struct QemuProvider {
    config: QemuConfig,
}

impl QemuProvider {
    pub fn new(config: QemuConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QemuConfig {
        &self.config
    }

    async fn base_image(&self, image: &str) -> PathBuf {
        let candidate = Path::new(image);
        if !image.is_empty() && tokio::fs::metadata(candidate).await.is_ok_and(|m| m.is_file()) {
            candidate.to_path_buf()
        } else {
            self.config.image_path.clone()
        }
    }

    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()> {
        let base = tokio::fs::canonicalize(base).await.map_err(|e| {
            CoreError::CreateFailed(format!("base image {}: {e}", base.display()))
        })?;
        let out = Command::new(&self.config.qemu_img)
            .args(["create", "-q", "-f", "qcow2", "-F", self.config.image_format.as_str(), "-b"])
            .arg(&base)
            .arg(overlay)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::CreateFailed(format!("failed to run qemu-img: {e}")))?;
        if !out.status.success() {
            return Err(CoreError::CreateFailed(format!(
                "qemu-img create failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        tracing::debug!(base = %base.display(), overlay = %overlay.display(), "Overlay created");
        Ok(())
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        backend: &mut QemuBackend,
    ) -> Result<(Arc<ConnectionClient>, Duration)> {
        let dir = self.config.work_dir.join(&spec.id);
        tokio::fs::create_dir_all(&dir).await?;
        backend.sandbox_dir = Some(dir.clone());

        let overlay = dir.join("overlay.qcow2");
        let base = self.base_image(&spec.image).await;
        self.create_overlay(&base, &overlay).await?;

        let log_path = dir.join("qemu.log");
        let log = tokio::fs::File::create(&log_path).await?.into_std().await;
        let args = self.config.args(spec, &overlay);
        tracing::debug!(sandbox_id = %spec.id, binary = %self.config.binary.display(), ?args, "Spawning QEMU");

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::CreateFailed(format!("failed to spawn QEMU: {e}")))?;
        backend.pid = child.id();

        let connected = tokio::select! {
            status = child.wait() => {
                let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                let reason = log.lines().last().unwrap_or_default().trim().to_string();
                match status {
                    Ok(status) => Err(CoreError::CreateFailed(format!("QEMU exited with {status}: {reason}"))),
                    Err(e) => Err(CoreError::CreateFailed(format!("QEMU wait failed: {e}"))),
                }
            }
            connected = self.config.ssh.connect_local(spec.ssh_port) => connected,
        };
        *backend.child.get_mut() = Some(child);
        let (client, ready) = connected?;
        backend.client = Some(client.clone());

        match client.exec(&self.config.mount_command(&spec.mount_target)).await {
            Ok(result) if result.success() => {
                tracing::debug!(sandbox_id = %spec.id, target = %spec.mount_target, "Workspace mounted");
            }
            Ok(result) => {
                tracing::warn!(
                    sandbox_id = %spec.id,
                    exit_code = result.exit_code,
                    stderr = %result.stderr.trim(),
                    "Workspace mount failed, guest has no shared directory"
                );
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %spec.id, error = %e, "Workspace mount failed");
            }
        }

        Ok((client, ready))
    }
}

#[async_trait]
impl SandboxProvider for QemuProvider {
    fn name(&self) -> &str {
        QEMU
    }

    async fn is_available(&self) -> bool {
        if tool_version(&self.config.binary).await.is_none() {
            tracing::debug!(binary = %self.config.binary.display(), "QEMU not found");
            return false;
        }
        if tool_version(&self.config.qemu_img).await.is_none() {
            tracing::debug!(binary = %self.config.qemu_img.display(), "qemu-img not found");
            return false;
        }
        true
    }

    async fn info(&self) -> ProviderInfo {
        let version = tool_version(&self.config.binary)
            .await
            .unwrap_or_else(|| "unknown".into());
        ProviderInfo::new(QEMU, version, IsolationType::Vm)
            .with_feature("ssh-exec")
            .with_feature("host-mount")
            .with_feature("port-forward")
            .with_feature("cow-overlay")
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<Sandbox> {
        let mut backend = QemuBackend::new(&spec.id);
        match self.launch(spec, &mut backend).await {
            Ok((client, ready)) => {
                tracing::info!(
                    sandbox_id = %spec.id,
                    pid = ?backend.pid,
                    ready_ms = ready.as_millis() as u64,
                    "VM ready"
                );
                Ok(Sandbox::new(spec, QEMU, Box::new(backend)).with_connection(client, ready))
            }
            Err(e) => {
                tracing::error!(sandbox_id = %spec.id, error = %e, "VM launch failed");
                backend.release().await;
                Err(e)
            }
        }
    }
}

struct QemuBackend {
    sandbox_id: String,
    sandbox_dir: Option<PathBuf>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    client: Option<Arc<ConnectionClient>>,
}

impl QemuBackend {
    fn new(sandbox_id: &str) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            sandbox_dir: None,
            child: Mutex::new(None),
            pid: None,
            client: None,
        }
    }

    async fn release(&self) {
        if let Some(client) = &self.client {
            client.disconnect().await;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if matches!(child.try_wait(), Ok(Some(_))) {
                tracing::debug!(sandbox_id = %self.sandbox_id, "QEMU already exited");
            } else if let Err(e) = child.kill().await {
                tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "Failed to kill QEMU");
            }
        }
        if let Some(dir) = &self.sandbox_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to remove overlay");
                }
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for QemuBackend {
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
        tracing::debug!(sandbox_id = %self.sandbox_id, "VM released");
        Ok(())
    }

    async fn memory_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
            .await
            .ok()?;
        parse_vm_rss(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            id: "sb-q".into(),
            image: String::new(),
            mount_path: PathBuf::from("/tmp/sandbench/sb-q/workspace"),
            ssh_port: 2230,
            memory_mib: Some(1024),
            cpus: None,
            env: BTreeMap::new(),
            mount_target: "/workspace".into(),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> &'a str {
        let i = args.iter().position(|a| a == flag).unwrap();
        &args[i + 1]
    }

    #[test]
    fn test_args() {
        let config = QemuConfig::default();
        let args = config.args(&spec(), Path::new("/tmp/sb-q/overlay.qcow2"));

        assert_eq!(value_after(&args, "-m"), "1024");
        assert_eq!(value_after(&args, "-smp"), "1");
        assert_eq!(
            value_after(&args, "-netdev"),
            "user,id=net0,hostfwd=tcp:127.0.0.1:2230-:22"
        );
        assert_eq!(
            value_after(&args, "-drive"),
            "file=/tmp/sb-q/overlay.qcow2,if=virtio,format=qcow2"
        );
        assert_eq!(
            value_after(&args, "-virtfs"),
            "local,path=/tmp/sandbench/sb-q/workspace,mount_tag=workspace,security_model=mapped-xattr,id=workspace"
        );
        assert!(value_after(&args, "-machine").ends_with(",accel=kvm:tcg"));
    }

    #[test]
    fn test_commas_in_paths_are_escaped() {
        let config = QemuConfig::default();
        let args = config.args(&spec(), Path::new("/tmp/a,b/overlay.qcow2"));
        assert_eq!(
            value_after(&args, "-drive"),
            "file=/tmp/a,,b/overlay.qcow2,if=virtio,format=qcow2"
        );
    }

    #[test]
    fn test_mount_command() {
        let config = QemuConfig::default();
        assert_eq!(
            config.mount_command("/workspace"),
            "mkdir -p /workspace && mount -t 9p -o trans=virtio,version=9p2000.L,msize=104857600 workspace /workspace"
        );
        assert!(config.mount_command("/my dir").contains("'/my dir'"));
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tqemu-system-x86\nVmPeak:\t 2000000 kB\nVmRSS:\t  524288 kB\nThreads:\t5\n";
        assert_eq!(parse_vm_rss(status), Some(524_288 * 1024));
        assert_eq!(parse_vm_rss("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("QEMU emulator version 8.2.2 (Debian 1:8.2.2+ds-0ubuntu1)\nCopyright"),
            Some("8.2.2".to_string())
        );
        assert_eq!(
            parse_version("qemu-img version 8.2.2\n"),
            Some("8.2.2".to_string())
        );
        assert_eq!(parse_version("garbage"), None);
    }

    #[tokio::test]
    async fn test_unavailable_without_binary() {
        let provider = QemuProvider::new(QemuConfig {
            binary: PathBuf::from("/nonexistent/qemu-system-x86_64"),
            ..Default::default()
        });
        assert!(!provider.is_available().await);
        assert_eq!(provider.info().await.version, "unknown");
    }

    #[tokio::test]
    async fn test_memory_reads_own_process() {
        let mut backend = QemuBackend::new("sb-q");
        backend.pid = Some(std::process::id());
        let rss = backend.memory_bytes().await;
        if cfg!(target_os = "linux") {
            assert!(rss.unwrap() > 0);
        }
        backend.shutdown().await.unwrap();
    }
}
