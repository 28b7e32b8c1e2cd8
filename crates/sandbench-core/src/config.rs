//! Sandbox configuration types.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Guest path the host mount is exposed at when none is given.
pub const DEFAULT_MOUNT_TARGET: &str = "/workspace";

/// Declarative request for one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Unique within one orchestrator.
    pub id: String,
    /// Backend image: an OCI reference, a rootfs or a disk image path.
    pub image: String,
    /// Host directory shared into the sandbox. Allocated when `None`.
    pub mount_path: Option<PathBuf>,
    /// Host port forwarded to the guest's SSH port. Allocated when `None`.
    pub ssh_port: Option<u16>,
    /// Memory in MiB (backend default when `None`).
    pub memory_mib: Option<u32>,
    /// vCPU count (backend default when `None`).
    pub cpus: Option<u32>,
    /// Environment applied to every command.
    pub env: BTreeMap<String, String>,
    /// Non-root identity to install. Commands run as root when `None`.
    pub user: Option<SandboxUser>,
    /// Guest path of the shared mount.
    pub mount_target: String,
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder(id: impl Into<String>, image: impl Into<String>) -> SandboxConfigBuilder {
        SandboxConfigBuilder {
            config: SandboxConfig {
                id: id.into(),
                image: image.into(),
                mount_path: None,
                ssh_port: None,
                memory_mib: None,
                cpus: None,
                env: BTreeMap::new(),
                user: None,
                mount_target: DEFAULT_MOUNT_TARGET.into(),
            },
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(CoreError::InvalidConfig("id is required".into()));
        }
        // ids become directory names and container names
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || self.id.starts_with('.')
        {
            return Err(CoreError::InvalidConfig(format!(
                "id must be [A-Za-z0-9._-] and not start with '.', got {:?}",
                self.id
            )));
        }
        if self.image.is_empty() {
            return Err(CoreError::InvalidConfig("image is required".into()));
        }
        if self.memory_mib == Some(0) {
            return Err(CoreError::InvalidConfig("memory_mib must be > 0".into()));
        }
        if self.cpus == Some(0) {
            return Err(CoreError::InvalidConfig("cpus must be > 0".into()));
        }
        if self.ssh_port == Some(0) {
            return Err(CoreError::InvalidConfig("ssh_port must be > 0".into()));
        }
        if !self.mount_target.starts_with('/') {
            return Err(CoreError::InvalidConfig(format!(
                "mount_target must be absolute, got {:?}",
                self.mount_target
            )));
        }
        if let Some(user) = &self.user {
            user.validate()?;
        }
        Ok(())
    }
}

/// Builder for SandboxConfig.
#[derive(Debug)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    pub fn mount_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mount_path = Some(path.into());
        self
    }

    pub fn ssh_port(mut self, port: u16) -> Self {
        self.config.ssh_port = Some(port);
        self
    }

    /// Set memory in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = Some(mib);
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.config.cpus = Some(cpus);
        self
    }

    /// Add one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Run commands as this user once it has been installed.
    pub fn user(mut self, user: SandboxUser) -> Self {
        self.config.user = Some(user);
        self
    }

    pub fn mount_target(mut self, target: impl Into<String>) -> Self {
        self.config.mount_target = target.into();
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SandboxConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Non-root identity installed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

impl SandboxUser {
    /// User with uid/gid 1000 and home `/home/{name}`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            home: format!("/home/{name}"),
            name,
            uid: 1000,
            gid: 1000,
        }
    }

    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home = home.into();
        self
    }

    /// Group name used on distros whose tools want a name, not a gid.
    pub fn group_name(&self) -> &str {
        &self.name
    }

    pub fn validate(&self) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self.name.len() <= 32
            && !self.name.starts_with('-')
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'));
        if !valid_name {
            return Err(CoreError::InvalidConfig(format!(
                "invalid user name {:?}",
                self.name
            )));
        }
        if self.uid == 0 || self.gid == 0 {
            return Err(CoreError::InvalidConfig(
                "sandbox user must not be uid/gid 0".into(),
            ));
        }
        if !self.home.starts_with('/') {
            return Err(CoreError::InvalidConfig(format!(
                "home must be absolute, got {:?}",
                self.home
            )));
        }
        Ok(())
    }
}
