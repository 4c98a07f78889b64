use crate::approval::write_atomic;
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::path::Path;
use tracing::{debug, info};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Evaluation metrics
    pub static ref EVALUATIONS_TOTAL: IntCounter = IntCounter::new(
        "renewgate_evaluations_total",
        "Total number of certificate expiry evaluations"
    ).unwrap();

    pub static ref EVALUATIONS_FAIL_OPEN: IntCounter = IntCounter::new(
        "renewgate_evaluations_fail_open_total",
        "Evaluations that requested renewal without expiry evidence"
    ).unwrap();

    // Approval metrics
    pub static ref APPROVALS_REQUESTED: IntCounter = IntCounter::new(
        "renewgate_approvals_requested_total",
        "Total number of approval requests created"
    ).unwrap();

    pub static ref APPROVALS_APPROVED: IntCounter = IntCounter::new(
        "renewgate_approvals_approved_total",
        "Total number of approval requests approved"
    ).unwrap();

    pub static ref APPROVALS_REJECTED: IntCounter = IntCounter::new(
        "renewgate_approvals_rejected_total",
        "Total number of approval requests rejected"
    ).unwrap();

    pub static ref APPROVALS_REFUSED: IntCounter = IntCounter::new(
        "renewgate_approvals_refused_total",
        "Approval decisions refused by validation"
    ).unwrap();

    // Renewal metrics
    pub static ref RENEWALS_SUCCEEDED: IntCounter = IntCounter::new(
        "renewgate_renewals_succeeded_total",
        "Total number of certificates issued"
    ).unwrap();

    pub static ref RENEWALS_FAILED: IntCounter = IntCounter::new(
        "renewgate_renewals_failed_total",
        "Total number of renewal runs that failed to issue a certificate"
    ).unwrap();

    pub static ref PROFILE_REFRESH_FAILURES: IntCounter = IntCounter::new(
        "renewgate_profile_refresh_failures_total",
        "Provisioning profiles that could not be refreshed"
    ).unwrap();

    pub static ref RENEWAL_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "renewgate_renewal_duration_seconds",
            "Time spent revoking, issuing and refreshing profiles"
        ).buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0])
    ).unwrap();

    // Notification metrics
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounter = IntCounter::new(
        "renewgate_notifications_sent_total",
        "Total number of notifications sent successfully"
    ).unwrap();

    pub static ref NOTIFICATIONS_FAILED_TOTAL: IntCounter = IntCounter::new(
        "renewgate_notifications_failed_total",
        "Total number of notifications that failed to send"
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY.register(Box::new(EVALUATIONS_TOTAL.clone())).ok();
    REGISTRY
        .register(Box::new(EVALUATIONS_FAIL_OPEN.clone()))
        .ok();
    REGISTRY
        .register(Box::new(APPROVALS_REQUESTED.clone()))
        .ok();
    REGISTRY.register(Box::new(APPROVALS_APPROVED.clone())).ok();
    REGISTRY.register(Box::new(APPROVALS_REJECTED.clone())).ok();
    REGISTRY.register(Box::new(APPROVALS_REFUSED.clone())).ok();
    REGISTRY.register(Box::new(RENEWALS_SUCCEEDED.clone())).ok();
    REGISTRY.register(Box::new(RENEWALS_FAILED.clone())).ok();
    REGISTRY
        .register(Box::new(PROFILE_REFRESH_FAILURES.clone()))
        .ok();
    REGISTRY.register(Box::new(RENEWAL_DURATION.clone())).ok();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_SENT_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_FAILED_TOTAL.clone()))
        .ok();

    debug!("Metrics registered");
}

/// Render the registry in the Prometheus text exposition format
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;

    String::from_utf8(buffer).context("Metrics output is not UTF-8")
}

/// Write the registry for a node-exporter textfile collector.
///
/// Stages are short-lived, so there is no scrape endpoint to serve.
pub fn write_textfile(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    write_atomic(path, render()?.as_bytes())?;
    info!("Wrote metrics to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_counters() {
        register_metrics();
        EVALUATIONS_TOTAL.inc();

        let text = render().unwrap();
        assert!(text.contains("renewgate_evaluations_total"));
        assert!(text.contains("renewgate_notifications_failed_total"));
    }

    #[test]
    fn test_write_textfile() {
        register_metrics();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector").join("renewgate.prom");

        write_textfile(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("renewgate_approvals_requested_total"));
    }
}
