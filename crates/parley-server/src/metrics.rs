//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle that renders `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Handle for a recorder that is not installed globally (tests, embedding).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

fn describe() {
    metrics::describe_counter!(CONNECTIONS_TOTAL, "Sockets accepted");
    metrics::describe_counter!(CONNECTIONS_CLOSED_TOTAL, "Sockets removed from the registry");
    metrics::describe_gauge!(CONNECTIONS_ACTIVE, "Sockets currently registered");
    metrics::describe_histogram!(CONNECTION_DURATION_SECONDS, "Socket lifetime");
    metrics::describe_counter!(MESSAGES_TOTAL, "Inbound envelopes by type");
    metrics::describe_counter!(ERRORS_TOTAL, "Error envelopes sent, by code");
    metrics::describe_counter!(HEARTBEAT_TERMINATIONS_TOTAL, "Connections reaped by the heartbeat");
    metrics::describe_gauge!(SESSIONS_ACTIVE, "Sessions in the directory");
    metrics::describe_counter!(SESSIONS_CREATED_TOTAL, "Sessions created");
    metrics::describe_counter!(SESSIONS_EXPIRED_TOTAL, "Sessions removed after the grace period");
    metrics::describe_counter!(BROADCASTS_TOTAL, "Translation fan-outs");
    metrics::describe_counter!(BROADCAST_DROPS_TOTAL, "Listener sends skipped during fan-out");
    metrics::describe_counter!(
        parley_providers::chain::PROVIDER_ATTEMPTS_TOTAL,
        "Provider calls by capability, provider, and outcome"
    );
    metrics::describe_histogram!(
        parley_providers::chain::PROVIDER_LATENCY_SECONDS,
        "Provider call latency"
    );
    metrics::describe_counter!(
        parley_providers::chain::PROVIDER_CHAIN_EXHAUSTED_TOTAL,
        "Chain invocations where every provider failed"
    );
    metrics::describe_gauge!(PROVIDER_DEGRADED, "1 when a provider's recent error rate is high");
}

/// Sockets accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Sockets removed from the registry (counter).
pub const CONNECTIONS_CLOSED_TOTAL: &str = "ws_disconnections_total";
/// Sockets currently registered (gauge).
pub const CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Socket lifetime (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Inbound envelopes (counter, labels: type).
pub const MESSAGES_TOTAL: &str = "relay_messages_total";
/// Error envelopes sent (counter, labels: code).
pub const ERRORS_TOTAL: &str = "relay_errors_total";
/// Connections terminated by the heartbeat (counter).
pub const HEARTBEAT_TERMINATIONS_TOTAL: &str = "heartbeat_terminations_total";
/// Sessions in the directory (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Sessions created (counter).
pub const SESSIONS_CREATED_TOTAL: &str = "sessions_created_total";
/// Sessions expired (counter).
pub const SESSIONS_EXPIRED_TOTAL: &str = "sessions_expired_total";
/// Translation fan-outs (counter).
pub const BROADCASTS_TOTAL: &str = "broadcasts_total";
/// Listener sends skipped during fan-out (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Provider degraded state (gauge, labels: provider).
pub const PROVIDER_DEGRADED: &str = "provider_degraded";
