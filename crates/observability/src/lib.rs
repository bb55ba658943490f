//! Process-wide tracing and metrics bootstrap for the mirror services.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Holds the pieces that must outlive the process setup phase: the log
/// writer guard flushes buffered lines on drop, the prometheus handle
/// renders the scrape payload.
pub struct Telemetry {
    pub prometheus: PrometheusHandle,
    _log_guard: WorkerGuard,
}

impl Telemetry {
    pub fn render_metrics(&self) -> String {
        self.prometheus.render()
    }
}

/// Install the tracing subscriber and the prometheus recorder. Call once
/// at startup, before any task is spawned; keep the returned value alive
/// for the lifetime of the process.
pub fn init(service_name: &str) -> Result<Telemetry> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, log_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init();

    let prometheus = match PROM_HANDLE.get() {
        Some(handle) => handle.clone(),
        None => {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .context("install prometheus recorder")?;
            let _ = PROM_HANDLE.set(handle.clone());
            handle
        }
    };

    Ok(Telemetry {
        prometheus,
        _log_guard: log_guard,
    })
}
