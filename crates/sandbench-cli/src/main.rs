//! sandbench entry point.
//!
//! Reads the run from `SANDBENCH_*` variables, benchmarks each selected
//! provider and prints the report to stdout. Logs go to stderr so the
//! report can be piped.

use sandbench_cli::{bench, BenchConfig};
use sandbench_core::{Orchestrator, OrchestratorConfig};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("sandbench=info".parse()?)
                .add_directive("sandbench_cli=info".parse()?)
                .add_directive("sandbench_core=info".parse()?)
                .add_directive("sandbench_providers=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = BenchConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn only: unavailable providers are skipped anyway
    config.validate_warn();

    let mut orchestrator = Orchestrator::new(OrchestratorConfig {
        base_dir: config.base_dir.clone(),
        port_base: config.port_base,
    });
    for name in &config.providers {
        match bench::build_provider(name, &config) {
            Some(provider) => orchestrator.register_provider(provider),
            None => tracing::warn!(provider = %name, "Unknown provider, ignoring"),
        }
    }

    let report = tokio::select! {
        report = bench::run(&orchestrator, &config) => Some(report),
        _ = signal::ctrl_c() => {
            tracing::info!("Interrupted, cleaning up");
            None
        }
    };

    // An interrupted run leaves sandboxes and mounts behind
    orchestrator.stop_all().await;
    bench::remove_leftover_containers(&config).await;
    for id in config.sandbox_ids() {
        if let Err(e) = orchestrator.cleanup_mount(&id).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Mount cleanup failed");
        }
    }

    match report {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        None => anyhow::bail!("benchmark interrupted"),
    }
}
