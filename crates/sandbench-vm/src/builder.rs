//! Fluent construction of a [`VmConfig`].

use crate::config::VmConfig;
use crate::error::Result;
use crate::machine::VirtualMachine;
use crate::network::TapNetwork;
use std::path::PathBuf;

/// Builder for a micro-VM.
///
/// ```no_run
/// use sandbench_vm::{NetworkAllocator, VmBuilder};
///
/// # async fn example() -> sandbench_vm::Result<()> {
/// let net = NetworkAllocator::new("sbtap").allocate("bench-0")?;
/// let vm = VmBuilder::new()
///     .memory_mib(512)
///     .kernel("/var/lib/sandbench/vmlinux")
///     .rootfs("/tmp/bench-0/rootfs.ext4")
///     .network(net)
///     .boot()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct VmBuilder {
    config: VmConfig,
}

impl VmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vcpus(mut self, vcpus: u8) -> Self {
        self.config.vcpus = vcpus;
        self
    }

    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel = path.into();
        self
    }

    /// Replace the kernel command line. The network's `ip=` argument is
    /// still appended.
    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.config.boot_args = args.into();
        self
    }

    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.rootfs = path.into();
        self
    }

    pub fn network(mut self, network: TapNetwork) -> Self {
        self.config.network = Some(network);
        self
    }

    pub fn firecracker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firecracker_binary = path.into();
        self
    }

    pub fn work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.work_dir = path.into();
        self
    }

    pub fn config(self) -> VmConfig {
        self.config
    }

    /// Boot the configured VM.
    pub async fn boot(self) -> Result<VirtualMachine> {
        VirtualMachine::boot(self.config).await
    }
}
