//! # sandbench-cli
//!
//! Benchmark driver comparing sandbox providers.
//!
//! For every selected provider the driver creates a batch of sandboxes
//! concurrently, runs the same command in each a fixed number of times,
//! and reports startup and command latency summaries as JSON.

pub mod bench;
pub mod config;

pub use bench::{build_provider, run, run_provider, BenchReport, ProviderReport, SandboxReport};
pub use config::{BenchConfig, ConfigError, KNOWN_PROVIDERS};
