//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when a provider's recent error rate is high.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Sessions in the directory.
    pub active_sessions: usize,
    /// Providers currently over the error threshold.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded_providers: Vec<String>,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    sessions: usize,
    degraded_providers: Vec<String>,
) -> HealthResponse {
    let status = if degraded_providers.is_empty() {
        "ok"
    } else {
        "degraded"
    };
    HealthResponse {
        status: status.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
        degraded_providers,
    }
}
