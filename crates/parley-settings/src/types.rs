//! Settings types with compiled defaults.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Socket server settings.
    pub server: ServerSettings,
    /// Liveness monitoring.
    pub heartbeat: HeartbeatSettings,
    /// Session directory behaviour.
    pub session: SessionSettings,
    /// Presenter audio buffering.
    pub audio: AudioSettings,
    /// Provider fallback chains.
    pub providers: ProvidersSettings,
    /// Session record persistence.
    pub storage: StorageSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.intervalMs must be greater than zero".into(),
            ));
        }
        if self.session.code_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "session.codeAttempts must be at least 1".into(),
            ));
        }
        if self.session.cleanup_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "session.cleanupIntervalMs must be greater than zero".into(),
            ));
        }
        if self.providers.per_call_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "providers.perCallTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Socket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Largest accepted socket message in bytes.
    pub max_message_bytes: usize,
    /// Outbound frames buffered per connection before drops.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_message_bytes: 16 * 1024 * 1024,
            send_queue_capacity: 256,
        }
    }
}

/// Heartbeat monitor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Tick interval in milliseconds.
    pub interval_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

/// Session directory settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// How long a presenter may be gone before the session expires.
    pub grace_period_ms: u64,
    /// Code-generation attempts before giving up.
    pub code_attempts: u32,
    /// How often expired sessions are swept.
    pub cleanup_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 300_000,
            code_attempts: 10,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Presenter audio buffering settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioSettings {
    /// Accumulate non-final chunks (otherwise only the final chunk is used).
    pub buffer_partial_chunks: bool,
    /// Largest accumulated utterance in bytes.
    pub max_buffer_bytes: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            buffer_partial_chunks: true,
            max_buffer_bytes: 26_214_400,
        }
    }
}

/// Provider implementation family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP API (Whisper, chat completions, speech).
    Openai,
    /// Self-hosted HTTP sidecar (`/transcribe`, `/translate`, `/synthesize`).
    Sidecar,
    /// Offline translator that returns text unchanged.
    Passthrough,
}

/// One entry in a provider chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    /// Implementation family.
    pub kind: ProviderKind,
    /// Name used in logs and metrics (defaults to the kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Service base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Voice for speech synthesis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl ProviderEntry {
    /// Bare entry of the given kind.
    pub fn of(kind: ProviderKind) -> Self {
        Self {
            kind,
            name: None,
            base_url: None,
            api_key_env: None,
            model: None,
            voice: None,
        }
    }

    /// Display name for logs and metrics.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            match self.kind {
                ProviderKind::Openai => "openai",
                ProviderKind::Sidecar => "sidecar",
                ProviderKind::Passthrough => "passthrough",
            }
            .to_string()
        })
    }
}

/// Provider chain settings, one ordered list per capability.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersSettings {
    /// Bound on each individual provider call.
    pub per_call_timeout_ms: u64,
    /// Speech-to-text chain.
    pub transcribe: Vec<ProviderEntry>,
    /// Translation chain.
    pub translate: Vec<ProviderEntry>,
    /// Speech synthesis chain.
    pub synthesize: Vec<ProviderEntry>,
}

impl Default for ProvidersSettings {
    fn default() -> Self {
        Self {
            per_call_timeout_ms: 15_000,
            transcribe: vec![
                ProviderEntry::of(ProviderKind::Openai),
                ProviderEntry::of(ProviderKind::Sidecar),
            ],
            translate: vec![ProviderEntry::of(ProviderKind::Openai)],
            synthesize: vec![ProviderEntry::of(ProviderKind::Openai)],
        }
    }
}

/// Session record persistence settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// `SQLite` database path; the in-memory store is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (`RUST_LOG` wins when set).
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}
