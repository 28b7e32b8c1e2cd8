//! Host-side TAP networking for micro-VMs.
//!
//! Every VM gets its own TAP device and a /30 out of 172.16.0.0/16:
//! host at `.{4k+1}`, guest at `.{4k+2}`. The guest kernel configures
//! its side from the `ip=` boot argument, so nothing has to run inside
//! the guest before it is reachable.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::process::Command;

/// /30 subnets in 172.16.0.0/16.
const SUBNETS: u32 = 1 << 14;

/// One guest interface and the host TAP device behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapNetwork {
    /// Firecracker interface id
    pub iface_id: String,
    pub tap_name: String,
    pub guest_mac: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
}

impl TapNetwork {
    /// Kernel `ip=` argument configuring eth0 statically on the /30.
    pub fn boot_arg(&self) -> String {
        format!(
            "ip={}::{}:255.255.255.252::eth0:off",
            self.guest_ip, self.host_ip
        )
    }
}

/// Hands out non-overlapping TAP networks. Indices are never reused.
#[derive(Debug)]
pub struct NetworkAllocator {
    next: AtomicU32,
    prefix: String,
}

impl NetworkAllocator {
    /// TAP devices are named `{prefix}{index}`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            next: AtomicU32::new(0),
            prefix: prefix.into(),
        }
    }

    pub fn allocate(&self, vm_id: &str) -> Result<TapNetwork> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        if index >= SUBNETS {
            return Err(VmError::Network(format!("all {SUBNETS} subnets in use")));
        }

        let [_, _, third, fourth] = (index * 4).to_be_bytes();
        let tap_name = format!("{}{index}", self.prefix);
        if tap_name.len() > 15 {
            return Err(VmError::Network(format!("TAP name too long: {tap_name}")));
        }

        Ok(TapNetwork {
            iface_id: format!("net-{}", iface_suffix(vm_id)),
            tap_name,
            guest_mac: format!("06:00:AC:10:{third:02X}:{:02X}", fourth + 2),
            host_ip: Ipv4Addr::new(172, 16, third, fourth + 1),
            guest_ip: Ipv4Addr::new(172, 16, third, fourth + 2),
        })
    }
}

/// Interface ids allow alphanumerics and hyphens only.
fn iface_suffix(vm_id: &str) -> String {
    vm_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(11)
        .collect()
}

/// Create the TAP device, give it the host address and bring it up.
///
/// A stale device with the same name is deleted first. Needs CAP_NET_ADMIN.
pub async fn setup_tap(network: &TapNetwork) -> Result<()> {
    let tap = network.tap_name.as_str();
    tracing::info!(
        tap,
        host_ip = %network.host_ip,
        guest_ip = %network.guest_ip,
        "Setting up TAP device"
    );

    if ip(&["link", "del", tap]).await.is_ok() {
        tracing::debug!(tap, "Removed stale TAP device");
    }
    ip(&["tuntap", "add", "dev", tap, "mode", "tap"]).await?;
    ip(&["addr", "add", &format!("{}/30", network.host_ip), "dev", tap]).await?;
    ip(&["link", "set", "dev", tap, "up"]).await
}

/// Delete the TAP device. A missing device is fine.
pub async fn teardown_tap(tap: &str) {
    match ip(&["link", "del", tap]).await {
        Ok(()) => tracing::debug!(tap, "TAP device removed"),
        Err(e) => tracing::debug!(tap, error = %e, "TAP teardown skipped"),
    }
}

async fn ip(args: &[&str]) -> Result<()> {
    tracing::trace!(?args, "ip");
    let output = Command::new("ip").args(args).output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(VmError::Network(format!(
        "`ip {}`: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_allocation() {
        let net = NetworkAllocator::new("sbtap").allocate("docker-0").unwrap();

        assert_eq!(net.tap_name, "sbtap0");
        assert_eq!(net.iface_id, "net-docker-0");
        assert_eq!(net.host_ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(net.guest_ip, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(net.guest_mac, "06:00:AC:10:00:02");
    }

    #[test]
    fn test_allocations_are_disjoint() {
        let alloc = NetworkAllocator::new("sbtap");
        let a = alloc.allocate("a").unwrap();
        let b = alloc.allocate("b").unwrap();

        assert_ne!(a.tap_name, b.tap_name);
        assert_eq!(b.host_ip, Ipv4Addr::new(172, 16, 0, 5));
        assert_eq!(b.guest_ip, Ipv4Addr::new(172, 16, 0, 6));
    }

    #[test]
    fn test_allocation_carries_into_third_octet() {
        let alloc = NetworkAllocator::new("sbtap");
        for i in 0..64 {
            alloc.allocate(&format!("vm-{i}")).unwrap();
        }
        let net = alloc.allocate("vm-64").unwrap();
        assert_eq!(net.host_ip, Ipv4Addr::new(172, 16, 1, 1));
        assert_eq!(net.guest_mac, "06:00:AC:10:01:02");
    }

    #[test]
    fn test_pool_exhaustion() {
        let alloc = NetworkAllocator::new("t");
        alloc.next.store(SUBNETS, Ordering::SeqCst);
        assert!(matches!(alloc.allocate("late"), Err(VmError::Network(_))));
    }

    #[test]
    fn test_long_tap_prefix_rejected() {
        let alloc = NetworkAllocator::new("a-very-long-prefix");
        assert!(alloc.allocate("vm").is_err());
    }

    #[test]
    fn test_iface_suffix() {
        assert_eq!(iface_suffix("bench_01!"), "bench01");
        assert_eq!(iface_suffix(&"x".repeat(20)).len(), 11);
    }
}
