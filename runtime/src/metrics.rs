//! Prometheus metrics for the denormalizer.
//!
//! Every component records through the small recorder types below:
//! - Revision guard outcomes (admitted, buffered, stale, missing, bypassed)
//! - Dispatch fan-out and restart recovery
//! - View builder commits and concurrency retries
//! - Replay throughput and failures
//!
//! Recording is always cheap: without an installed recorder the `metrics`
//! macros are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use denormalizer_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(body) = server.render() {
//!     println!("{body}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter handle for the denormalizer's metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will report `addr` as its scrape address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that is already installed (several servers in one test binary) is not
    /// an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Denormalizer metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// The installed Prometheus handle.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Revision guard
    describe_counter!(
        "denormalizer_events_admitted_total",
        "Events admitted in revision order"
    );
    describe_counter!(
        "denormalizer_events_buffered_total",
        "Events buffered because they arrived ahead of their predecessor"
    );
    describe_counter!(
        "denormalizer_events_stale_total",
        "Events dropped because their revision was already applied"
    );
    describe_counter!(
        "denormalizer_events_missing_total",
        "Buffered events whose predecessor was declared missing"
    );
    describe_counter!(
        "denormalizer_events_bypassed_total",
        "Events dispatched without revision ordering"
    );
    describe_counter!(
        "denormalizer_revision_conflicts_total",
        "Revision store compare-and-swap conflicts"
    );
    describe_gauge!(
        "denormalizer_events_waiting",
        "Events currently buffered by the revision guard"
    );

    // Dispatch
    describe_counter!(
        "dispatcher_events_dispatched_total",
        "Events fanned out to view builders"
    );
    describe_counter!(
        "dispatcher_events_extended_total",
        "Events that completed every consumer and extender"
    );
    describe_counter!(
        "dispatcher_events_reemitted_total",
        "Unfinished events re-issued after a restart"
    );

    // Collections
    describe_counter!(
        "collection_commits_total",
        "View models committed outside of replay, per collection"
    );

    // View builders
    describe_counter!(
        "viewbuilder_commits_total",
        "View models committed by view builders"
    );
    describe_counter!(
        "viewbuilder_commit_retries_total",
        "Denormalizations retried after a concurrency conflict"
    );
    describe_histogram!(
        "viewbuilder_denormalize_duration_seconds",
        "Time taken to denormalize one event into one collection"
    );

    // Replay
    describe_counter!("replay_events_total", "Events fed into a replay");
    describe_counter!(
        "replay_duplicates_total",
        "Events skipped by a replay as duplicates"
    );
    describe_counter!("replay_errors_total", "Errors collected during replay");
    describe_histogram!(
        "replay_duration_seconds",
        "Time taken to finish a replay, including the final flush"
    );
}

/// Revision guard recorder.
pub struct GuardMetrics;

impl GuardMetrics {
    /// Record events admitted by one admission chain.
    pub fn record_admitted(count: usize) {
        counter!("denormalizer_events_admitted_total").increment(count as u64);
    }

    /// Record an out-of-order event being buffered.
    pub fn record_buffered(waiting: usize) {
        counter!("denormalizer_events_buffered_total").increment(1);
        Self::record_waiting(waiting);
    }

    /// Record a stale event being dropped.
    pub fn record_stale() {
        counter!("denormalizer_events_stale_total").increment(1);
    }

    /// Record a missing-event escalation.
    pub fn record_missing() {
        counter!("denormalizer_events_missing_total").increment(1);
    }

    /// Record an event dispatched without ordering.
    pub fn record_bypassed() {
        counter!("denormalizer_events_bypassed_total").increment(1);
    }

    /// Record a revision store CAS conflict.
    pub fn record_conflict() {
        counter!("denormalizer_revision_conflicts_total").increment(1);
    }

    /// Record how many events are currently buffered.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_waiting(waiting: usize) {
        gauge!("denormalizer_events_waiting").set(waiting as f64);
    }
}

/// Dispatcher recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record one event fanned out.
    pub fn record_dispatched() {
        counter!("dispatcher_events_dispatched_total").increment(1);
    }

    /// Record one event fully extended.
    pub fn record_extended() {
        counter!("dispatcher_events_extended_total").increment(1);
    }

    /// Record events re-issued after a restart.
    pub fn record_reemitted(count: usize) {
        counter!("dispatcher_events_reemitted_total").increment(count as u64);
    }
}

/// View builder recorder.
pub struct ViewBuilderMetrics;

impl ViewBuilderMetrics {
    /// Record one denormalization with the view models it committed.
    pub fn record_denormalize(commits: usize, duration: Duration) {
        counter!("viewbuilder_commits_total").increment(commits as u64);
        histogram!("viewbuilder_denormalize_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a retry after a concurrency conflict.
    pub fn record_retry() {
        counter!("viewbuilder_commit_retries_total").increment(1);
    }
}

/// Replay recorder.
pub struct ReplayMetrics;

impl ReplayMetrics {
    /// Record one replayed event.
    pub fn record_event() {
        counter!("replay_events_total").increment(1);
    }

    /// Record one skipped duplicate.
    pub fn record_duplicate() {
        counter!("replay_duplicates_total").increment(1);
    }

    /// Record a finished replay.
    pub fn record_finished(errors: usize, duration: Duration) {
        counter!("replay_errors_total").increment(errors as u64);
        histogram!("replay_duration_seconds").record(duration.as_secs_f64());
    }
}
