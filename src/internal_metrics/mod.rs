//! # Internal Metrics Module
//!
//! - **`MetricsBuilder`**: installs the Prometheus recorder together with its
//!   HTTP listener, which serves the scrape endpoint on the configured address.
//!
//! - **`Metrics`**: a cloneable handle with the gauges the application sets
//!   at startup. Per-event counters are recorded through the `metrics` macros
//!   at their call sites.

use crate::config::MetricsConfig;
use metrics::{Gauge, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing::info;

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// The public API for the metrics system.
#[derive(Clone)]
pub struct Metrics {
    watched_ips: Gauge,
    watched_subnets: Gauge,
    patterns_loaded: Gauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Registers descriptions for all metrics with the global recorder.
    pub fn new() -> Self {
        // Stream
        metrics::describe_counter!("stream_messages_total", Unit::Count, "Total number of text frames received from the certificate stream.");
        metrics::describe_counter!("stream_heartbeats_total", Unit::Count, "Total number of heartbeat messages received.");
        metrics::describe_counter!("stream_certificates_total", Unit::Count, "Total number of certificate updates received.");
        metrics::describe_counter!("stream_malformed_frames_total", Unit::Count, "Total number of frames that could not be decoded.");
        metrics::describe_counter!("stream_reconnects_total", Unit::Count, "Total number of scheduled reconnection attempts.");
        metrics::describe_counter!("stream_stalls_total", Unit::Count, "Total number of sessions closed because the stream went silent.");
        metrics::describe_gauge!("stream_connection_state", Unit::Count, "Connection state: 0 disconnected, 1 connecting, 2 connected, 3 reconnecting, 4 exhausted.");

        // Matching
        metrics::describe_counter!("dns_queries_total", Unit::Count, "Total number of DNS queries performed, labeled by their outcome.");
        metrics::describe_histogram!("dns_resolution_duration_seconds", Unit::Seconds, "A histogram of the latency for DNS resolutions.");
        metrics::describe_counter!("dns_failures_total", Unit::Count, "Total number of resolutions that failed or timed out during matching.");
        metrics::describe_counter!("certificates_excluded_total", Unit::Count, "Total number of certificates skipped by the exclusion list.");
        metrics::describe_counter!("alerts_total", Unit::Count, "Total number of alerts raised, labeled by match type.");
        metrics::describe_gauge!("watched_ips", Unit::Count, "Number of watched IP addresses.");
        metrics::describe_gauge!("watched_subnets", Unit::Count, "Number of watched /24 subnets.");
        metrics::describe_gauge!("patterns_loaded", Unit::Count, "Number of domain patterns loaded.");

        // Fingerprinting
        metrics::describe_counter!("extractions_total", Unit::Count, "Fingerprint extraction attempts, labeled by tier and outcome.");
        metrics::describe_counter!("verifications_total", Unit::Count, "Completed verifications, labeled by verdict.");

        // Outputs
        metrics::describe_counter!("notifications_sent_total", Unit::Count, "Notifications delivered, labeled by output.");
        metrics::describe_counter!("notification_failures_total", Unit::Count, "Notifications an output failed to deliver, labeled by output.");

        Self {
            watched_ips: metrics::gauge!("watched_ips"),
            watched_subnets: metrics::gauge!("watched_subnets"),
            patterns_loaded: metrics::gauge!("patterns_loaded"),
        }
    }

    pub fn set_watched_infrastructure(&self, ips: usize, subnets: usize) {
        self.watched_ips.set(ips as f64);
        self.watched_subnets.set(subnets as f64);
    }

    pub fn set_patterns_loaded(&self, count: usize) {
        self.patterns_loaded.set(count as f64);
    }
}

/// Builder for the metrics system.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Installs the Prometheus recorder and its HTTP listener when enabled.
    ///
    /// Must be called from within a Tokio runtime. When disabled, the
    /// returned handle records into the no-op default recorder.
    pub fn build(self) -> anyhow::Result<Metrics> {
        if !self.config.enabled {
            return Ok(Metrics::new());
        }

        PrometheusBuilder::new()
            .with_http_listener(self.config.listen_address)
            .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), DURATION_BUCKETS)?
            .install()?;

        info!(address = %self.config.listen_address, "Prometheus endpoint listening");
        Ok(Metrics::new())
    }
}
