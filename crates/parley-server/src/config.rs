//! Server configuration.

use std::time::Duration;

use parley_settings::RelaySettings;
use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatchConfig;

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Heartbeat tick interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Presenter reattachment window in milliseconds.
    pub grace_period_ms: u64,
    /// Session-code generation attempts.
    pub code_attempts: u32,
    /// Expiry sweep interval in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Accumulate non-final audio chunks.
    pub buffer_partial_audio: bool,
    /// Largest accumulated utterance in bytes.
    pub max_audio_bytes: usize,
    /// Seconds to wait for tasks during shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 16 * 1024 * 1024,
            send_queue_capacity: 256,
            heartbeat_interval_ms: 30_000,
            grace_period_ms: 300_000,
            code_attempts: 10,
            cleanup_interval_ms: 60_000,
            buffer_partial_audio: true,
            max_audio_bytes: 25 * 1024 * 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_bytes,
            send_queue_capacity: settings.server.send_queue_capacity,
            heartbeat_interval_ms: settings.heartbeat.interval_ms,
            grace_period_ms: settings.session.grace_period_ms,
            code_attempts: settings.session.code_attempts,
            cleanup_interval_ms: settings.session.cleanup_interval_ms,
            buffer_partial_audio: settings.audio.buffer_partial_chunks,
            max_audio_bytes: settings.audio.max_buffer_bytes,
            ..Self::default()
        }
    }

    /// Heartbeat tick interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Presenter reattachment window.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Expiry sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Dispatcher settings derived from this config.
    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            grace_period: self.grace_period(),
            buffer_partial_audio: self.buffer_partial_audio,
            max_audio_bytes: self.max_audio_bytes,
            ..DispatchConfig::default()
        }
    }
}
