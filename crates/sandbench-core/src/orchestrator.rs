//! Orchestrator: provider registry and sandbox lifecycle.

use crate::bootstrap::setup_user;
use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::exec::{ExecRequest, ExecResult};
use crate::provider::{LaunchSpec, ProviderInfo, SandboxProvider};
use crate::sandbox::Sandbox;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Configuration for the Orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Parent of every sandbox's mount directory.
    pub base_dir: PathBuf,
    /// First port handed out by [`Orchestrator::allocate_port`].
    pub port_base: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("sandbench"),
            port_base: 2222,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Arc<Sandbox>>,
    /// Ids whose creation is in flight.
    reserved: HashSet<String>,
}

/// Owns providers and every sandbox created through them.
///
/// Safe to share across tasks. Ports come from an atomic counter and
/// are never reused for the lifetime of the value; mount directories
/// are disjoint per sandbox id.
pub struct Orchestrator {
    config: OrchestratorConfig,
    providers: Vec<Arc<dyn SandboxProvider>>,
    registry: RwLock<Registry>,
    next_port: AtomicU32,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        tracing::info!(
            base_dir = %config.base_dir.display(),
            port_base = config.port_base,
            "Creating orchestrator"
        );
        Self {
            next_port: AtomicU32::new(u32::from(config.port_base)),
            config,
            providers: Vec::new(),
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register a provider. Lookup is by name, first registration wins.
    pub fn register_provider(&mut self, provider: Arc<dyn SandboxProvider>) {
        if self.provider(provider.name()).is_some() {
            tracing::warn!(provider = %provider.name(), "Provider already registered, ignoring");
            return;
        }
        tracing::debug!(provider = %provider.name(), "Provider registered");
        self.providers.push(provider);
    }

    fn provider(&self, name: &str) -> Option<&Arc<dyn SandboxProvider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Names of registered providers, in registration order.
    pub fn providers(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Info for every provider whose backend is usable on this host.
    pub async fn available_providers(&self) -> Vec<ProviderInfo> {
        let mut available = Vec::new();
        for provider in &self.providers {
            if provider.is_available().await {
                available.push(provider.info().await);
            } else {
                tracing::debug!(provider = %provider.name(), "Provider unavailable");
            }
        }
        available
    }

    fn mount_root(&self, id: &str) -> PathBuf {
        self.config.base_dir.join(id)
    }

    /// Create `{base_dir}/{id}/workspace` and return it.
    pub async fn create_mount_path(&self, id: &str) -> Result<PathBuf> {
        let path = self.mount_root(id).join("workspace");
        tokio::fs::create_dir_all(&path).await?;
        tracing::trace!(sandbox_id = %id, path = %path.display(), "Mount path created");
        Ok(path)
    }

    /// Next port from the counter.
    ///
    /// # Errors
    /// [`CoreError::PortsExhausted`] once the counter passes 65535.
    pub fn allocate_port(&self) -> Result<u16> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        u16::try_from(port).map_err(|_| CoreError::PortsExhausted)
    }

    /// Create a sandbox on the named provider and register it.
    ///
    /// Fills in mount path and port when the config leaves them out, then
    /// installs `config.user` if one is given. A failed user setup leaves
    /// the sandbox registered and running as root, and returns
    /// [`CoreError::UserSetupFailed`].
    pub async fn create_sandbox(&self, provider_name: &str, config: SandboxConfig) -> Result<Arc<Sandbox>> {
        config.validate()?;

        let provider = self
            .provider(provider_name)
            .ok_or_else(|| CoreError::ProviderNotFound(provider_name.to_string()))?
            .clone();
        if !provider.is_available().await {
            return Err(CoreError::ProviderUnavailable(provider_name.to_string()));
        }

        {
            let mut registry = self.registry.write().await;
            if registry.active.contains_key(&config.id) || registry.reserved.contains(&config.id) {
                return Err(CoreError::DuplicateSandbox(config.id));
            }
            registry.reserved.insert(config.id.clone());
        }

        let id = config.id.clone();
        let user = config.user.clone();
        let launched = self.launch(provider.as_ref(), config).await;

        let sandbox = {
            let mut registry = self.registry.write().await;
            registry.reserved.remove(&id);
            let sandbox = Arc::new(launched?);
            registry.active.insert(id.clone(), sandbox.clone());
            sandbox
        };
        tracing::info!(
            sandbox_id = %id,
            provider = %provider_name,
            ssh_port = sandbox.ssh_port(),
            "Sandbox registered"
        );

        if let Some(user) = user {
            if let Err(e) = setup_user(&sandbox, &user).await {
                tracing::error!(
                    sandbox_id = %id,
                    user = %user.name,
                    error = %e,
                    "User setup failed, sandbox stays on root"
                );
                return Err(e);
            }
        }

        Ok(sandbox)
    }

    async fn launch(&self, provider: &dyn SandboxProvider, config: SandboxConfig) -> Result<Sandbox> {
        let start = Instant::now();

        let ssh_port = match config.ssh_port {
            Some(port) => port,
            None => self.allocate_port()?,
        };
        let allocated_mount = config.mount_path.is_none();
        let mount_path = match config.mount_path {
            Some(path) => {
                tokio::fs::create_dir_all(&path).await?;
                path
            }
            None => self.create_mount_path(&config.id).await?,
        };

        let spec = LaunchSpec {
            id: config.id,
            image: config.image,
            mount_path,
            ssh_port,
            memory_mib: config.memory_mib,
            cpus: config.cpus,
            env: config.env,
            mount_target: config.mount_target,
        };
        tracing::info!(
            sandbox_id = %spec.id,
            provider = %provider.name(),
            image = %spec.image,
            mount_path = %spec.mount_path.display(),
            ssh_port = spec.ssh_port,
            "Creating sandbox"
        );

        let mut sandbox = match provider.create(&spec).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                tracing::error!(sandbox_id = %spec.id, error = %e, "Sandbox creation failed");
                if allocated_mount {
                    let _ = remove_tree(&self.mount_root(&spec.id)).await;
                }
                return Err(e);
            }
        };
        sandbox.set_startup(start.elapsed());

        tracing::info!(
            sandbox_id = %spec.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox started"
        );
        Ok(sandbox)
    }

    /// Look up a sandbox.
    pub async fn get(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.registry.read().await.active.get(id).cloned()
    }

    /// Ids of registered sandboxes.
    pub async fn ids(&self) -> Vec<String> {
        self.registry.read().await.active.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.registry.read().await.active.len()
    }

    /// Run a command on a registered sandbox.
    pub async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecResult> {
        let sandbox = self
            .get(id)
            .await
            .ok_or_else(|| CoreError::SandboxNotFound(id.to_string()))?;
        sandbox.exec(request).await
    }

    /// Stop and unregister one sandbox. Returns whether it was registered.
    pub async fn stop_sandbox(&self, id: &str) -> bool {
        let sandbox = self.registry.write().await.active.remove(id);
        match sandbox {
            Some(sandbox) => {
                sandbox.stop().await;
                true
            }
            None => {
                tracing::debug!(sandbox_id = %id, "Stop requested for unknown sandbox");
                false
            }
        }
    }

    /// Stop every registered sandbox concurrently.
    ///
    /// Failures are logged by each sandbox and never abort the rest.
    pub async fn stop_all(&self) {
        let sandboxes = std::mem::take(&mut self.registry.write().await.active);
        if sandboxes.is_empty() {
            return;
        }

        let start = Instant::now();
        let count = sandboxes.len();
        tracing::info!(count, "Stopping all sandboxes");

        futures::future::join_all(sandboxes.values().map(|sandbox| sandbox.stop())).await;

        tracing::info!(
            count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "All sandboxes stopped"
        );
    }

    /// Remove `{base_dir}/{id}` recursively. A missing directory is fine.
    pub async fn cleanup_mount(&self, id: &str) -> Result<()> {
        let root = self.mount_root(id);
        remove_tree(&root).await?;
        tracing::debug!(sandbox_id = %id, path = %root.display(), "Mount cleaned up");
        Ok(())
    }
}

async fn remove_tree(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove mount");
            Err(e.into())
        }
    }
}
