//! Heartbeat ping/pong liveness monitoring across the registry.
//!
//! Each tick takes every connection's alive flag. A connection that has not
//! answered since the previous tick is terminated; the rest are marked
//! tentative and pinged. A connection that never answers is therefore gone
//! after at most two ticks, and one whose ping cannot be queued is
//! terminated on the spot.

use std::sync::Arc;
use std::time::Duration;

use parley_core::ConnectionId;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::metrics::HEARTBEAT_TERMINATIONS_TOTAL;
use crate::registry::ConnectionRegistry;

/// Hook run after the monitor terminates a connection.
pub type TerminateCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Why a connection was terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// No pong since the previous tick.
    Unresponsive,
    /// The ping could not be queued.
    PingFailed,
}

impl TerminationReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Unresponsive => "unresponsive",
            Self::PingFailed => "ping_failed",
        }
    }
}

/// Result of one tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections pinged.
    pub pinged: usize,
    /// Connections removed, with the reason.
    pub terminated: Vec<(ConnectionId, TerminationReason)>,
}

/// Registry-wide liveness monitor.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    on_terminate: Option<TerminateCallback>,
}

impl HeartbeatMonitor {
    /// Monitor over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            on_terminate: None,
        }
    }

    /// Run `callback` after each termination.
    #[must_use]
    pub fn with_callback(mut self, callback: TerminateCallback) -> Self {
        self.on_terminate = Some(callback);
        self
    }

    /// Probe every registered connection once.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for connection in self.registry.snapshot() {
            if !connection.check_alive() {
                self.terminate(&connection, TerminationReason::Unresponsive);
                report
                    .terminated
                    .push((connection.id().clone(), TerminationReason::Unresponsive));
            } else if connection.send_ping() {
                report.pinged += 1;
            } else {
                self.terminate(&connection, TerminationReason::PingFailed);
                report
                    .terminated
                    .push((connection.id().clone(), TerminationReason::PingFailed));
            }
        }
        if !report.terminated.is_empty() {
            debug!(
                pinged = report.pinged,
                terminated = report.terminated.len(),
                "heartbeat tick"
            );
        }
        report
    }

    fn terminate(&self, connection: &Arc<Connection>, reason: TerminationReason) {
        warn!(
            connection_id = %connection.id(),
            reason = reason.as_str(),
            idle_ms = u64::try_from(connection.last_seen_elapsed().as_millis()).unwrap_or(u64::MAX),
            "terminating connection"
        );
        metrics::counter!(HEARTBEAT_TERMINATIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        connection.terminate();
        let _ = self.registry.unregister(connection.id());
        if let Some(callback) = &self.on_terminate {
            callback(connection);
        }
    }

    /// Tick every `interval` until `cancel` fires. The first tick happens
    /// one interval after start.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "heartbeat monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.tick();
                }
                () = cancel.cancelled() => {
                    debug!("heartbeat monitor stopped");
                    return;
                }
            }
        }
    }
}
