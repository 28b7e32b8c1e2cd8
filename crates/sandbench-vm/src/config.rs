//! Sizing and boot description of one micro-VM.

use crate::error::{Result, VmError};
use crate::network::TapNetwork;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kernel command line used when none is given.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

pub const MAX_VCPUS: u8 = 32;
pub const MIN_MEMORY_MIB: u32 = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub vcpus: u8,
    pub memory_mib: u32,
    pub kernel: PathBuf,
    pub boot_args: String,
    /// Writable root block device, `/dev/vda` in the guest.
    pub rootfs: PathBuf,
    pub network: Option<TapNetwork>,
    pub firecracker_binary: PathBuf,
    /// Firecracker chroot. Each VM keeps its API socket under `{work_dir}/{vm id}`.
    pub work_dir: PathBuf,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mib: 256,
            kernel: PathBuf::from("/var/lib/sandbench/vmlinux"),
            boot_args: DEFAULT_BOOT_ARGS.into(),
            rootfs: PathBuf::from("/var/lib/sandbench/rootfs.ext4"),
            network: None,
            firecracker_binary: PathBuf::from("/usr/local/bin/firecracker"),
            work_dir: std::env::temp_dir().join("sandbench").join("vms"),
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_VCPUS).contains(&self.vcpus) {
            return Err(VmError::InvalidConfig(format!(
                "vcpus must be within 1..={MAX_VCPUS}, got {}",
                self.vcpus
            )));
        }
        if self.memory_mib < MIN_MEMORY_MIB {
            return Err(VmError::InvalidConfig(format!(
                "memory_mib must be at least {MIN_MEMORY_MIB}, got {}",
                self.memory_mib
            )));
        }
        if self.rootfs.as_os_str().is_empty() {
            return Err(VmError::InvalidConfig("rootfs path is empty".into()));
        }
        Ok(())
    }

    /// Boot arguments plus the guest's static address, if networked.
    pub fn kernel_cmdline(&self) -> String {
        match &self.network {
            Some(net) => format!("{} {}", self.boot_args, net.boot_arg()),
            None => self.boot_args.clone(),
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        u64::from(self.memory_mib) * 1024 * 1024
    }
}
