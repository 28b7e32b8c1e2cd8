//! Benchmark runs: create sandboxes per provider, time commands, summarize.

use crate::config::BenchConfig;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use sandbench_core::{
    ExecRequest, Orchestrator, ProviderInfo, SandboxConfig, SandboxMetrics, SandboxProvider,
    SandboxUser, Summary, SYNTHETIC_EXIT_CODE,
};
use sandbench_providers::{
    DockerConfig, DockerProvider, FirecrackerConfig, FirecrackerProvider, QemuConfig,
    QemuProvider, SshSettings, DOCKER, FIRECRACKER, QEMU,
};
use serde::Serialize;
use std::sync::Arc;

/// Result of a whole run, one entry per benchmarked provider.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub started_at: DateTime<Utc>,
    pub providers: Vec<ProviderReport>,
    /// Selected providers that were not available on this host.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderReport {
    pub provider: ProviderInfo,
    pub requested: usize,
    pub created: usize,
    pub create_failures: usize,
    /// Sandbox startup times, in milliseconds.
    pub startup: Option<Summary>,
    /// Latency of every command the sandbox ran to an exit status, in
    /// milliseconds.
    pub exec_latency: Option<Summary>,
    /// Commands that errored or exited non-zero.
    pub exec_failures: usize,
    pub sandboxes: Vec<SandboxReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxReport {
    pub id: String,
    pub metrics: SandboxMetrics,
}

/// Build the provider called `name` from the run configuration.
pub fn build_provider(name: &str, config: &BenchConfig) -> Option<Arc<dyn SandboxProvider>> {
    let ssh = SshSettings {
        user: config.ssh_user.clone(),
        identity_file: config.ssh_key.clone(),
        ..Default::default()
    };

    let provider: Arc<dyn SandboxProvider> = match name {
        DOCKER => Arc::new(DockerProvider::new(DockerConfig {
            socket_path: config.docker_socket.clone(),
            ..Default::default()
        })),
        FIRECRACKER => Arc::new(FirecrackerProvider::new(FirecrackerConfig {
            firecracker_path: config.firecracker_path.clone(),
            kernel_path: config.kernel_path.clone(),
            rootfs_path: config.rootfs_path.clone(),
            ssh,
            ..Default::default()
        })),
        QEMU => {
            let defaults = QemuConfig::default();
            Arc::new(QemuProvider::new(QemuConfig {
                binary: config.qemu_binary.clone().unwrap_or(defaults.binary.clone()),
                image_path: config.qemu_image.clone(),
                ssh,
                ..defaults
            }))
        }
        _ => return None,
    };
    Some(provider)
}

/// Remove Docker containers this run labelled but never got to stop.
///
/// A no-op unless docker is among the selected providers.
pub async fn remove_leftover_containers(config: &BenchConfig) {
    if !config.providers.iter().any(|p| p == DOCKER) {
        return;
    }
    let docker = DockerProvider::new(DockerConfig {
        socket_path: config.docker_socket.clone(),
        ..Default::default()
    });
    let ids: Vec<String> = config
        .sandbox_ids()
        .into_iter()
        .filter(|id| id.starts_with(DOCKER))
        .collect();
    match docker.remove_labelled(&ids).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(containers = n, "Removed leftover containers"),
        Err(e) => tracing::warn!(error = %e, "Leftover container sweep failed"),
    }
}

fn sandbox_id(provider: &str, index: usize) -> String {
    format!("{provider}-{index}")
}

fn sandbox_config(provider: &str, index: usize, config: &BenchConfig) -> sandbench_core::Result<SandboxConfig> {
    let mut builder = SandboxConfig::builder(sandbox_id(provider, index), config.image_for(provider));
    if let Some(mib) = config.memory_mib {
        builder = builder.memory_mib(mib);
    }
    if let Some(cpus) = config.cpus {
        builder = builder.cpus(cpus);
    }
    if let Some(user) = &config.user {
        builder = builder.user(SandboxUser::new(user));
    }
    builder.build()
}

fn bench_request(config: &BenchConfig) -> ExecRequest {
    let (program, args) = match config.command.split_first() {
        Some((program, args)) => (program.as_str(), args),
        None => ("true", &[][..]),
    };
    ExecRequest::new(program)
        .args(args.iter().cloned())
        .timeout(config.exec_timeout)
}

/// Benchmark every selected provider in order.
///
/// Providers that are not registered or not available are skipped with a
/// warning.
pub async fn run(orchestrator: &Orchestrator, config: &BenchConfig) -> BenchReport {
    let started_at = Utc::now();
    let available = orchestrator.available_providers().await;

    let mut providers = Vec::new();
    let mut skipped = Vec::new();
    for name in &config.providers {
        match available.iter().find(|info| &info.name == name) {
            Some(info) => providers.push(run_provider(orchestrator, info.clone(), config).await),
            None => {
                tracing::warn!(provider = %name, "Provider not available, skipping");
                skipped.push(name.clone());
            }
        }
    }

    BenchReport {
        started_at,
        providers,
        skipped,
    }
}

/// Benchmark one provider, then stop its sandboxes and remove their mounts.
pub async fn run_provider(orchestrator: &Orchestrator, info: ProviderInfo, config: &BenchConfig) -> ProviderReport {
    let owned_name = info.name.clone();
    let name = owned_name.as_str();
    tracing::info!(
        provider = %name,
        count = config.count,
        iterations = config.iterations,
        "Benchmarking provider"
    );

    let ids: Vec<String> = (0..config.count).map(|i| sandbox_id(name, i)).collect();
    let creates = (0..config.count).map(|i| async move {
        let sandbox_config = sandbox_config(name, i, config)?;
        orchestrator.create_sandbox(name, sandbox_config).await
    });

    let mut sandboxes = Vec::new();
    let mut create_failures = 0;
    for (id, created) in ids.iter().zip(join_all(creates).await) {
        match created {
            Ok(sandbox) => sandboxes.push(sandbox),
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Sandbox creation failed");
                create_failures += 1;
            }
        }
    }

    let request = bench_request(config);
    let runs = sandboxes.iter().map(|sandbox| {
        let request = request.clone();
        async move {
            let mut latencies = Vec::with_capacity(config.iterations);
            let mut failures = 0;
            for _ in 0..config.iterations {
                match sandbox.exec(request.clone()).await {
                    Ok(result) => {
                        // synthetic results never reached the guest
                        if result.exit_code != SYNTHETIC_EXIT_CODE {
                            latencies.push(result.duration_ms);
                        }
                        if !result.success() {
                            tracing::debug!(
                                sandbox_id = %sandbox.id(),
                                exit_code = result.exit_code,
                                stderr = %result.stderr.trim_end(),
                                "Command failed"
                            );
                            failures += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "Malformed command output");
                        failures += 1;
                    }
                }
            }
            (latencies, failures)
        }
    });

    let mut latencies = Vec::new();
    let mut exec_failures = 0;
    for (samples, failures) in join_all(runs).await {
        latencies.extend(samples);
        exec_failures += failures;
    }

    let mut reports = Vec::with_capacity(sandboxes.len());
    for sandbox in &sandboxes {
        reports.push(SandboxReport {
            id: sandbox.id().to_string(),
            metrics: sandbox.update_stats().await,
        });
    }
    let startups: Vec<f64> = reports.iter().map(|r| r.metrics.startup_ms).collect();

    // ids whose user setup failed are still registered and need stopping too
    for id in &ids {
        orchestrator.stop_sandbox(id).await;
        if let Err(e) = orchestrator.cleanup_mount(id).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Mount cleanup failed");
        }
    }

    let report = ProviderReport {
        provider: info,
        requested: config.count,
        created: sandboxes.len(),
        create_failures,
        startup: Summary::compute(&startups).ok(),
        exec_latency: Summary::compute(&latencies).ok(),
        exec_failures,
        sandboxes: reports,
    };
    tracing::info!(
        provider = %report.provider.name,
        created = report.created,
        exec_failures = report.exec_failures,
        "Provider benchmark finished"
    );
    report
}
