// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Tracing goes to stderr, filtered by `RUST_LOG` (default `info`). Set
//! `AUTOX_LOG_FORMAT=json` for one JSON object per line.
//!
//! Metrics recorded by the controller:
//!
//! - `autox_scripts_started_total`
//! - `autox_scripts_finished_total{outcome}`
//! - `autox_scripts_running`

use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("AUTOX_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| EngineError::Config(format!("tracing already initialised: {}", e)))
}

/// Serve Prometheus metrics over HTTP on `addr`
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Config(format!("metrics exporter: {}", e)))?;
    tracing::info!("Metrics available on http://{}/metrics", addr);
    Ok(())
}
