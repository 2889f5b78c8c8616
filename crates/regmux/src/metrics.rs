//! Observer hooks for sync and HTTP metrics.
//!
//! The core reports through this trait and never depends on a concrete
//! metrics system; embedders wire a provider, and everything defaults to
//! no-ops when none is given.

use std::time::Duration;

/// Metric sinks the engine and the HTTP layer report into.
pub trait Metrics: Send + Sync {
    /// Per-registry server count gauge, updated after each successful
    /// sync and after managed-registry mutations.
    fn record_server_count(&self, _registry: &str, _count: u64) {}

    /// Sync duration histogram, labeled by success.
    fn record_sync_duration(&self, _registry: &str, _duration: Duration, _success: bool) {}

    /// HTTP request duration and count.
    fn record_http_request(&self, _method: &str, _path: &str, _status: u16, _duration: Duration) {}

    /// In-flight HTTP request gauge delta (+1 on entry, -1 on exit).
    fn http_requests_in_flight(&self, _delta: i64) {}
}

/// Default provider: drops everything.
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}
