//! Configuration for the benchmark driver.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Providers the driver knows how to build.
pub const KNOWN_PROVIDERS: [&str; 3] = ["docker", "firecracker", "qemu"];

/// Configuration for one benchmark run.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Providers to benchmark, in order.
    pub providers: Vec<String>,

    /// Sandboxes created concurrently per provider.
    pub count: usize,

    /// Commands run per sandbox.
    pub iterations: usize,

    /// Benchmarked command, as argv.
    pub command: Vec<String>,

    /// Bound on one benchmarked command.
    pub exec_timeout: Duration,

    /// Non-root user to install in every sandbox, if any.
    pub user: Option<String>,

    pub memory_mib: Option<u32>,
    pub cpus: Option<u32>,

    /// Parent of the per-sandbox mount directories.
    pub base_dir: PathBuf,

    /// First forwarded SSH port.
    pub port_base: u16,

    /// Container image for the docker provider.
    pub docker_image: String,
    pub docker_socket: PathBuf,

    pub firecracker_path: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,

    pub qemu_binary: Option<PathBuf>,
    pub qemu_image: PathBuf,

    /// Guest login for the VM providers.
    pub ssh_user: String,
    pub ssh_key: Option<PathBuf>,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no providers selected")]
    NoProviders,

    #[error("unknown provider: {0} (expected one of docker, firecracker, qemu)")]
    UnknownProvider(String),

    #[error("benchmark command is empty")]
    EmptyCommand,

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("kernel file not found: {0}")]
    MissingKernel(PathBuf),

    #[error("rootfs file not found: {0}")]
    MissingRootfs(PathBuf),

    #[error("firecracker binary not found: {0}")]
    MissingFirecracker(PathBuf),

    #[error("qemu disk image not found: {0}")]
    MissingQemuImage(PathBuf),

    #[error("ssh key not found: {0}")]
    MissingSshKey(PathBuf),
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            providers: vec!["docker".into()],
            count: 1,
            iterations: 10,
            command: vec!["echo".into(), "hello".into()],
            exec_timeout: Duration::from_secs(30),
            user: None,
            memory_mib: None,
            cpus: None,
            base_dir: std::env::temp_dir().join("sandbench"),
            port_base: 2222,
            docker_image: "alpine:3.20".into(),
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/sandbench/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/sandbench/rootfs.ext4"),
            qemu_binary: None,
            qemu_image: PathBuf::from("/var/lib/sandbench/guest.qcow2"),
            ssh_user: "root".into(),
            ssh_key: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

impl BenchConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SANDBENCH_PROVIDERS` | `docker` (comma-separated) |
    /// | `SANDBENCH_COUNT` | `1` |
    /// | `SANDBENCH_ITERATIONS` | `10` |
    /// | `SANDBENCH_COMMAND` | `echo hello` (split on whitespace) |
    /// | `SANDBENCH_EXEC_TIMEOUT_SECS` | `30` |
    /// | `SANDBENCH_USER` | unset (commands run as root) |
    /// | `SANDBENCH_MEMORY_MIB` | backend default |
    /// | `SANDBENCH_CPUS` | backend default |
    /// | `SANDBENCH_BASE_DIR` | `$TMPDIR/sandbench` |
    /// | `SANDBENCH_PORT_BASE` | `2222` |
    /// | `SANDBENCH_DOCKER_IMAGE` | `alpine:3.20` |
    /// | `SANDBENCH_DOCKER_SOCKET` | `/var/run/docker.sock` |
    /// | `SANDBENCH_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `SANDBENCH_KERNEL` | `/var/lib/sandbench/vmlinux` |
    /// | `SANDBENCH_ROOTFS` | `/var/lib/sandbench/rootfs.ext4` |
    /// | `SANDBENCH_QEMU` | `qemu-system-<arch>` |
    /// | `SANDBENCH_QEMU_IMAGE` | `/var/lib/sandbench/guest.qcow2` |
    /// | `SANDBENCH_SSH_USER` | `root` |
    /// | `SANDBENCH_SSH_KEY` | ssh client default |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            providers: var("SANDBENCH_PROVIDERS")
                .map(|v| {
                    v.split(',')
                        .map(|p| p.trim().to_lowercase())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or(default.providers),
            count: parsed(var("SANDBENCH_COUNT")).unwrap_or(default.count),
            iterations: parsed(var("SANDBENCH_ITERATIONS")).unwrap_or(default.iterations),
            command: var("SANDBENCH_COMMAND")
                .map(|v| v.split_whitespace().map(String::from).collect())
                .unwrap_or(default.command),
            exec_timeout: parsed(var("SANDBENCH_EXEC_TIMEOUT_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(default.exec_timeout),
            user: var("SANDBENCH_USER").or(default.user),
            memory_mib: parsed(var("SANDBENCH_MEMORY_MIB")).or(default.memory_mib),
            cpus: parsed(var("SANDBENCH_CPUS")).or(default.cpus),
            base_dir: var("SANDBENCH_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.base_dir),
            port_base: parsed(var("SANDBENCH_PORT_BASE")).unwrap_or(default.port_base),
            docker_image: var("SANDBENCH_DOCKER_IMAGE").unwrap_or(default.docker_image),
            docker_socket: var("SANDBENCH_DOCKER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(default.docker_socket),
            firecracker_path: var("SANDBENCH_FIRECRACKER")
                .map(PathBuf::from)
                .unwrap_or(default.firecracker_path),
            kernel_path: var("SANDBENCH_KERNEL")
                .map(PathBuf::from)
                .unwrap_or(default.kernel_path),
            rootfs_path: var("SANDBENCH_ROOTFS")
                .map(PathBuf::from)
                .unwrap_or(default.rootfs_path),
            qemu_binary: var("SANDBENCH_QEMU").map(PathBuf::from).or(default.qemu_binary),
            qemu_image: var("SANDBENCH_QEMU_IMAGE")
                .map(PathBuf::from)
                .unwrap_or(default.qemu_image),
            ssh_user: var("SANDBENCH_SSH_USER").unwrap_or(default.ssh_user),
            ssh_key: var("SANDBENCH_SSH_KEY").map(PathBuf::from).or(default.ssh_key),
        }
    }

    fn selects(&self, provider: &str) -> bool {
        self.providers.iter().any(|p| p == provider)
    }

    /// Ids of every sandbox the run creates, `{provider}-{index}`.
    pub fn sandbox_ids(&self) -> Vec<String> {
        self.providers
            .iter()
            .flat_map(|p| (0..self.count).map(move |i| format!("{p}-{i}")))
            .collect()
    }

    /// Image handed to `provider` for every sandbox.
    pub fn image_for(&self, provider: &str) -> String {
        match provider {
            "firecracker" => self.rootfs_path.to_string_lossy().into_owned(),
            "qemu" => self.qemu_image.to_string_lossy().into_owned(),
            _ => self.docker_image.clone(),
        }
    }

    /// Validate the run shape and the files the selected providers need.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        if let Some(unknown) = self
            .providers
            .iter()
            .find(|p| !KNOWN_PROVIDERS.contains(&p.as_str()))
        {
            return Err(ConfigError::UnknownProvider(unknown.clone()));
        }
        if self.command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.count == 0 {
            return Err(ConfigError::Zero("count"));
        }
        if self.iterations == 0 {
            return Err(ConfigError::Zero("iterations"));
        }

        if self.selects("firecracker") {
            if !self.kernel_path.exists() {
                return Err(ConfigError::MissingKernel(self.kernel_path.clone()));
            }
            if !self.rootfs_path.exists() {
                return Err(ConfigError::MissingRootfs(self.rootfs_path.clone()));
            }
            if !self.firecracker_path.exists() {
                return Err(ConfigError::MissingFirecracker(self.firecracker_path.clone()));
            }
        }
        if self.selects("qemu") && !self.qemu_image.exists() {
            return Err(ConfigError::MissingQemuImage(self.qemu_image.clone()));
        }
        if let Some(key) = &self.ssh_key {
            if !key.exists() {
                return Err(ConfigError::MissingSshKey(key.clone()));
            }
        }

        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Unavailable providers are skipped at run time anyway.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration problem");
        }
    }
}
