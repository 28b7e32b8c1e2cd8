//! Provider contract: backend-specific sandbox factories.

use crate::error::Result;
use crate::sandbox::Sandbox;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Kind of isolation a backend provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationType {
    /// Namespaces and cgroups on the host kernel
    Container,
    /// Minimal VM with its own kernel
    MicroVm,
    /// Conventional full VM
    Vm,
}

impl fmt::Display for IsolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::MicroVm => write!(f, "microvm"),
            Self::Vm => write!(f, "vm"),
        }
    }
}

/// Capability description of a backend, built fresh on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub version: String,
    pub isolation_type: IsolationType,
    pub features: BTreeSet<String>,
}

impl ProviderInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>, isolation_type: IsolationType) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            isolation_type,
            features: BTreeSet::new(),
        }
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }
}

/// A sandbox request with mount path and port already allocated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub id: String,
    pub image: String,
    /// Host directory, guaranteed to exist.
    pub mount_path: PathBuf,
    pub ssh_port: u16,
    pub memory_mib: Option<u32>,
    pub cpus: Option<u32>,
    pub env: BTreeMap<String, String>,
    /// Guest path of the shared mount.
    pub mount_target: String,
}

/// Turns a [`LaunchSpec`] into a running [`Sandbox`].
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Registry name, e.g. `"docker"`.
    fn name(&self) -> &str;

    /// Whether the backend can be used on this host. Never fails.
    async fn is_available(&self) -> bool;

    async fn info(&self) -> ProviderInfo;

    /// Start an instance.
    ///
    /// # Errors
    /// [`CoreError::CreateFailed`](crate::CoreError::CreateFailed) when the
    /// backend refuses. Anything partially created is removed first.
    async fn create(&self, spec: &LaunchSpec) -> Result<Sandbox>;
}
