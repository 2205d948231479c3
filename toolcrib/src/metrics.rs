//! Prometheus exporter and metric descriptions.
//!
//! # Exported metrics
//!
//! ## Counters
//! - `toolcrib.checkout.total` - successful checkouts
//! - `toolcrib.checkout.conflicts` - checkouts that lost to another session
//! - `toolcrib.ledger.compensations{operation}` - second writes undone
//! - `toolcrib.ledger.consistency_violations{operation}` - pairs left disagreeing
//! - `toolcrib.alerts.generated{class}` / `toolcrib.alerts.deduplicated{class}`
//! - `toolcrib.alerts.resolved`
//! - `toolcrib.feed.reconciliations` - single-row fetches for unknown alerts
//! - `toolcrib.channel.publish_failures`
//! - `toolcrib.sweep.runs{outcome}`
//!
//! ## Histograms
//! - `toolcrib.sweep.duration_seconds`

use crate::config::MetricsConfig;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from exporter setup
#[derive(Error, Debug)]
pub enum MetricsError {
    /// `host:port` did not parse
    #[error("Invalid metrics address {address}: {reason}")]
    Address {
        /// Configured address
        address: String,
        /// Parser message
        reason: String,
    },
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Install the Prometheus recorder and its `/metrics` listener.
///
/// Must be called from inside a tokio runtime.
///
/// # Errors
///
/// [`MetricsError`] if the address is invalid or the exporter cannot be
/// installed.
pub fn install_exporter(config: &MetricsConfig) -> Result<(), MetricsError> {
    let address = config.address();
    let addr: SocketAddr = address.parse().map_err(|e: std::net::AddrParseError| {
        MetricsError::Address {
            address: address.clone(),
            reason: e.to_string(),
        }
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    register_metrics();
    tracing::info!(%addr, "Metrics exporter listening");
    Ok(())
}

/// Register every metric description
pub fn register_metrics() {
    describe_counter!("toolcrib.checkout.total", "Successful checkouts");
    describe_counter!(
        "toolcrib.checkout.conflicts",
        "Checkouts rejected because the tool was already reserved"
    );
    describe_counter!(
        "toolcrib.ledger.compensations",
        "Pair writes whose first write had to be undone"
    );
    describe_counter!(
        "toolcrib.ledger.consistency_violations",
        "Pair writes that left tool and reservation disagreeing"
    );

    describe_counter!("toolcrib.alerts.generated", "Alerts raised by class");
    describe_counter!(
        "toolcrib.alerts.deduplicated",
        "Alert generations skipped because an unresolved alert already existed"
    );
    describe_counter!("toolcrib.alerts.resolved", "Alerts resolved as stale");
    describe_counter!(
        "toolcrib.channel.publish_failures",
        "Alert row changes that could not be published"
    );
    describe_counter!(
        "toolcrib.feed.reconciliations",
        "Single-row fetches for alerts unknown to a feed"
    );

    describe_counter!("toolcrib.sweep.runs", "Sweep runs by outcome");
    describe_histogram!(
        "toolcrib.sweep.duration_seconds",
        "Time taken by one sweep including retries"
    );
}
