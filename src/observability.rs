//! Logging and metrics initialization.
//!
//! The core only emits: `tracing` events with structured fields and
//! `metrics` counters/gauges. The embedder decides where both go —
//! [`init`] wires a default `tracing-subscriber` for processes that
//! have no opinion, and any `metrics` recorder installed by the
//! embedder picks up the engine's counters.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::error::{Result, SkiffError};

/// Install the default tracing subscriber. `RUST_LOG` overrides the
/// configured level. Safe to call once per process; embedders with
/// their own subscriber skip this entirely.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| SkiffError::Internal(format!("failed to init logging: {}", e)))?;
    } else {
        registry
            .with(fmt::layer())
            .try_init()
            .map_err(|e| SkiffError::Internal(format!("failed to init logging: {}", e)))?;
    }
    Ok(())
}

/// Describe the engine's metrics to whatever recorder is installed.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "skiff_commands_appended",
        "Commands appended to the replicated log by a local leader"
    );
    metrics::describe_counter!("skiff_log_appends", "Durable log entry writes");
    metrics::describe_counter!(
        "skiff_log_truncations",
        "Conflicting-suffix truncations performed by the save queue"
    );
    metrics::describe_counter!("skiff_elections_started", "Candidacies entered");
    metrics::describe_counter!("skiff_backfill_batches", "Catch-up batches streamed to peers");
    metrics::describe_counter!(
        "skiff_pool_buffers_created",
        "Message-pool misses that allocated a fresh buffer"
    );
    metrics::describe_gauge!("skiff_commit_index", "Commit index of the local leader");
    metrics::describe_gauge!("skiff_engines_running", "Running engine instances");
}
