//! A Firecracker micro-VM driven through firepilot.

use crate::api::set_machine_config;
use crate::config::VmConfig;
use crate::error::{Result, VmError};
use firepilot::builder::drive::DriveBuilder;
use firepilot::builder::executor::FirecrackerExecutorBuilder;
use firepilot::builder::kernel::KernelBuilder;
use firepilot::builder::network_interface::NetworkInterfaceBuilder;
use firepilot::builder::{Builder, Configuration};
use firepilot::machine::Machine;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

const ROOT_DRIVE_ID: &str = "rootfs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Stopped,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A booted guest and the Firecracker process behind it.
pub struct VirtualMachine {
    id: Uuid,
    config: VmConfig,
    state: VmState,
    machine: Machine,
    boot_time: Duration,
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("vcpus", &self.config.vcpus)
            .field("memory_mib", &self.config.memory_mib)
            .finish_non_exhaustive()
    }
}

/// Translate a [`VmConfig`] into firepilot's configuration.
fn firepilot_config(id: Uuid, config: &VmConfig) -> Result<Configuration> {
    let kernel = KernelBuilder::new()
        .with_kernel_image_path(config.kernel.to_string_lossy().into_owned())
        .with_boot_args(config.kernel_cmdline())
        .try_build()
        .map_err(|e| VmError::InvalidConfig(format!("kernel: {e:?}")))?;

    let executor = FirecrackerExecutorBuilder::new()
        .with_chroot(config.work_dir.to_string_lossy().into_owned())
        .with_exec_binary(config.firecracker_binary.clone())
        .try_build()
        .map_err(|e| VmError::InvalidConfig(format!("executor: {e:?}")))?;

    let root = DriveBuilder::new()
        .with_drive_id(ROOT_DRIVE_ID.to_string())
        .with_path_on_host(config.rootfs.clone())
        .as_root_device()
        .try_build()
        .map_err(|e| VmError::InvalidConfig(format!("root drive: {e:?}")))?;

    let mut fc = Configuration::new(id.to_string())
        .with_kernel(kernel)
        .with_executor(executor)
        .with_drive(root);

    if let Some(net) = &config.network {
        let iface = NetworkInterfaceBuilder::new()
            .with_iface_id(net.iface_id.clone())
            .with_host_dev_name(net.tap_name.clone())
            .with_guest_mac(net.guest_mac.clone())
            .try_build()
            .map_err(|e| VmError::InvalidConfig(format!("interface {}: {e:?}", net.iface_id)))?;
        fc = fc.with_interface(iface);
    }
    Ok(fc)
}

impl VirtualMachine {
    /// Launch Firecracker, size the machine and start the guest.
    ///
    /// Returns once the guest is started, not once it has finished booting;
    /// callers wait for a service inside it.
    pub async fn boot(config: VmConfig) -> Result<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        let start = Instant::now();
        tracing::info!(
            vm_id = %id,
            vcpus = config.vcpus,
            memory_mib = config.memory_mib,
            rootfs = %config.rootfs.display(),
            "Booting micro-VM"
        );

        let mut machine = Machine::new();
        machine
            .create(firepilot_config(id, &config)?)
            .await
            .map_err(|e| VmError::Launch(format!("{e:?}")))?;

        let vm = Self {
            id,
            config,
            state: VmState::Stopped,
            machine,
            boot_time: Duration::ZERO,
        };
        vm.start(start).await
    }

    async fn start(mut self, start: Instant) -> Result<Self> {
        let sized = set_machine_config(&self.api_socket(), self.config.vcpus, self.config.memory_mib).await;
        let started = match sized {
            Ok(()) => self
                .machine
                .start()
                .await
                .map_err(|e| VmError::Boot(format!("{e:?}"))),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            // the Firecracker process is already running
            self.state = VmState::Running;
            if let Err(cleanup) = self.destroy().await {
                tracing::warn!(error = %cleanup, "Cleanup after failed boot failed");
            }
            return Err(e);
        }

        self.state = VmState::Running;
        self.boot_time = start.elapsed();
        tracing::info!(
            vm_id = %self.id,
            elapsed_ms = self.boot_time.as_millis() as u64,
            "Micro-VM started"
        );
        Ok(self)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Time from process launch to guest start.
    pub fn boot_time(&self) -> Duration {
        self.boot_time
    }

    fn vm_dir(&self) -> PathBuf {
        self.config.work_dir.join(self.id.to_string())
    }

    /// Firecracker API socket of this VM.
    pub fn api_socket(&self) -> PathBuf {
        self.vm_dir().join("firecracker.socket")
    }

    pub fn guest_ip(&self) -> Option<Ipv4Addr> {
        self.config.network.as_ref().map(|n| n.guest_ip)
    }

    /// Memory assigned to the guest.
    pub fn memory_bytes(&self) -> u64 {
        self.config.memory_bytes()
    }

    /// Kill the Firecracker process. A stopped VM is left alone.
    pub async fn kill(&mut self) -> Result<()> {
        if self.state == VmState::Stopped {
            return Ok(());
        }
        self.machine
            .kill()
            .await
            .map_err(|e| VmError::Kill(format!("{e:?}")))?;
        self.state = VmState::Stopped;
        tracing::debug!(vm_id = %self.id, "Firecracker killed");
        Ok(())
    }

    /// Kill the VM and remove its chroot directory.
    pub async fn destroy(mut self) -> Result<()> {
        tracing::info!(vm_id = %self.id, "Destroying micro-VM");
        let killed = self.kill().await;
        remove_dir(&self.vm_dir()).await;
        killed
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Failed to remove VM directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(VmState::Running.to_string(), "running");
        assert_eq!(VmState::Stopped.to_string(), "stopped");
    }

    #[tokio::test]
    async fn test_boot_rejects_invalid_config() {
        let config = VmConfig {
            vcpus: 0,
            ..Default::default()
        };
        let err = VirtualMachine::boot(config).await.unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));
    }
}
