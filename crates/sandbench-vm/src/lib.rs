//! # sandbench-vm
//!
//! Firecracker launcher for the sandbench micro-VM backend: machine
//! sizing over the API socket, per-VM TAP networks with kernel IP
//! autoconfiguration, and kill/cleanup.
//!
//! ```no_run
//! use sandbench_vm::{setup_tap, teardown_tap, NetworkAllocator, VmBuilder, VmState};
//!
//! # async fn example() -> sandbench_vm::Result<()> {
//! let allocator = NetworkAllocator::new("sbtap");
//! let net = allocator.allocate("bench-0")?;
//! setup_tap(&net).await?;
//!
//! let vm = VmBuilder::new()
//!     .kernel("/var/lib/sandbench/vmlinux")
//!     .rootfs("/var/lib/sandbench/rootfs.ext4")
//!     .network(net.clone())
//!     .boot()
//!     .await?;
//! assert_eq!(vm.state(), VmState::Running);
//!
//! vm.destroy().await?;
//! teardown_tap(&net.tap_name).await;
//! # Ok(())
//! # }
//! ```

mod api;
mod builder;
mod config;
mod error;
mod machine;
mod network;

pub use builder::VmBuilder;
pub use config::{VmConfig, DEFAULT_BOOT_ARGS, MAX_VCPUS, MIN_MEMORY_MIB};
pub use error::{Result, VmError};
pub use machine::{VirtualMachine, VmState};
pub use network::{setup_tap, teardown_tap, NetworkAllocator, TapNetwork};
