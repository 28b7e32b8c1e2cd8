//! # sandbench-providers
//!
//! Isolation backends for sandbench, one [`SandboxProvider`] each:
//!
//! | Provider                | Isolation  | Exec path                  |
//! |-------------------------|------------|----------------------------|
//! | [`DockerProvider`]      | container  | Engine API, framed stream  |
//! | [`FirecrackerProvider`] | micro-VM   | SSH over a TAP forwarder   |
//! | [`QemuProvider`]        | full VM    | SSH over user-mode hostfwd |
//!
//! [`SandboxProvider`]: sandbench_core::SandboxProvider

mod docker;
mod firecracker;
mod forward;
mod qemu;
mod ssh;

pub use docker::{container_name, DockerConfig, DockerProvider, DEFAULT_SOCKET, DOCKER, LABEL_SANDBOX_ID};
pub use firecracker::{FirecrackerConfig, FirecrackerProvider, FIRECRACKER};
pub use forward::PortForwarder;
pub use qemu::{parse_vm_rss, QemuConfig, QemuProvider, QEMU};
pub use ssh::SshSettings;
