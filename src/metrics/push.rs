//! One-shot export of a batch run's metrics to a Prometheus Pushgateway.

use crate::config::MetricsConfig;
use crate::error::Result;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{debug, info, warn};

pub const JOB_NAME: &str = "card_show_scraper";

/// Push the rendered snapshot when a gateway is configured, otherwise log it.
/// A failed push is logged and never fails the run.
pub async fn publish_run_metrics(config: &MetricsConfig, handle: &PrometheusHandle) {
    let body = handle.render();
    let Some(gateway) = config.pushgateway_url.as_deref() else {
        debug!("Run metrics snapshot:\n{}", body);
        return;
    };
    let instance = config.instance.as_deref().unwrap_or("local");
    match push_metrics(gateway, instance, body).await {
        Ok(()) => info!("Pushed run metrics to Pushgateway for instance={}", instance),
        Err(e) => warn!("Failed to push run metrics to {}: {}", gateway, e),
    }
}

pub async fn push_metrics(gateway_url: &str, instance: &str, body: String) -> Result<()> {
    let push_url = format!(
        "{}/metrics/job/{}/instance/{}",
        gateway_url.trim_end_matches('/'),
        JOB_NAME,
        instance
    );
    reqwest::Client::new()
        .post(&push_url)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
