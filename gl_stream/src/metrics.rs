//! ABOUTME: Metrics collection for streaming services
//! ABOUTME: Prometheus counters for connections, frames, and backpressure

use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for streaming operations
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    /// Total number of client connections
    pub connections_total: Counter,
    /// Total number of client disconnections
    pub disconnections_total: Counter,
    /// Total number of frames written to clients
    pub frames_streamed: Counter,
    /// Total number of dropped frames (backpressure)
    pub frames_dropped: Counter,
    /// Total number of streams that ended with a capture failure
    pub stream_failures: Counter,
    /// Current number of connected stream clients
    pub clients: Gauge,
}

impl StreamMetrics {
    /// Create new streaming metrics
    pub fn new() -> Self {
        Self::default()
    }
}
