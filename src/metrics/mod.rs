//! Metrics for the ingestion pipeline and the review surface.
//!
//! Each phase owns its metric names in a submodule. Recording goes through the
//! `metrics` facade, so it is a no-op until a recorder is installed. `serve`
//! renders the Prometheus recorder at `/metrics`; `run` installs it too and
//! hands the final snapshot to [`push::publish_run_metrics`].

pub mod pipeline;
pub mod push;
pub mod review;

pub use pipeline::PipelineMetrics;
pub use review::ReviewMetrics;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::{info, warn};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once and return its render handle.
///
/// Returns `None` if another recorder was already installed by someone else.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Some(handle.clone());
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            register_all_metrics();
            info!("Prometheus recorder installed");
            Some(HANDLE.get_or_init(|| handle).clone())
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Each phase pre-registers its metrics so they show up before first use.
pub trait PhaseMetrics {
    fn register_metrics();
}

pub fn register_all_metrics() {
    PipelineMetrics::register_metrics();
    ReviewMetrics::register_metrics();
}
