//! Wire protocol: tagged JSON envelopes keyed by `type`.
//!
//! Inbound frames are parsed once at the socket boundary by
//! [`Inbound::parse`]. Unknown `type` values are reported as
//! [`ParsedFrame::Unknown`] so the caller can log and ignore them; known
//! types with missing or mistyped fields become [`RelayError::Validation`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RelayError;
use crate::ids::{ConnectionId, SessionCode};

/// Role a connection takes after `register`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Source of speech/text for a session.
    #[serde(alias = "teacher")]
    Presenter,
    /// Receives translated output.
    #[serde(alias = "student")]
    Listener,
}

impl Role {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Presenter => "presenter",
            Self::Listener => "listener",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a presenter's transcriptions are delivered automatically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationMode {
    /// Translate and broadcast every transcription.
    #[default]
    Auto,
    /// Hold transcriptions until an explicit `send_translation`.
    Manual,
}

/// Session-scoped settings owned by the presenter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Gates the presenter's transcription flow.
    pub translation_mode: TranslationMode,
    /// Attach synthesized speech to translations.
    pub tts_enabled: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            translation_mode: TranslationMode::Auto,
            tts_enabled: true,
        }
    }
}

impl SessionSettings {
    /// Apply a partial update. Returns `true` if anything changed.
    pub fn apply(&mut self, patch: &SettingsPatch) -> bool {
        let before = self.clone();
        if let Some(mode) = patch.translation_mode {
            self.translation_mode = mode;
        }
        if let Some(tts) = patch.tts_enabled {
            self.tts_enabled = tts;
        }
        *self != before
    }
}

/// Partial settings carried by an inbound `settings` envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    /// New translation mode.
    #[serde(default)]
    pub translation_mode: Option<TranslationMode>,
    /// New synthesis toggle.
    #[serde(default)]
    pub tts_enabled: Option<bool>,
}

/// Body of a `register` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Requested role.
    pub role: Role,
    /// BCP-47 language of the sender (`en-US`, `es-ES`, ...).
    pub language_code: String,
    /// Code to join (listener) or resume (presenter).
    #[serde(default)]
    pub session_code: Option<String>,
    /// Optional human-readable name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Stable presenter identity used for reattachment.
    #[serde(default)]
    pub teacher_id: Option<String>,
}

/// Body of an `audio` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    /// Base64 audio bytes (a `data:` URI prefix is tolerated).
    pub data: String,
    /// Whether this chunk completes the utterance.
    #[serde(default)]
    pub is_final_chunk: bool,
}

/// Inbound envelope.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Assign role and language.
    Register(RegisterRequest),
    /// Presenter audio chunk.
    Audio(AudioChunk),
    /// Pre-transcribed presenter text.
    Transcription {
        /// Recognized text.
        text: String,
    },
    /// Explicit release of text to listeners.
    SendTranslation {
        /// Text to translate and broadcast.
        text: String,
    },
    /// Presenter settings update.
    Settings {
        /// Fields to change.
        settings: SettingsPatch,
    },
    /// Courtesy liveness echo.
    Ping {
        /// Client timestamp, echoed back untouched.
        #[serde(default)]
        timestamp: Option<Value>,
    },
    /// Listener question for the presenter.
    StudentRequest {
        /// Question text in the listener's language.
        text: String,
    },
    /// Presenter answer to one listener.
    #[serde(rename_all = "camelCase")]
    TeacherReply {
        /// Listener connection to answer.
        connection_id: ConnectionId,
        /// Answer text in the presenter's language.
        text: String,
    },
}

/// Every `type` value [`Inbound`] understands.
pub const INBOUND_TYPES: &[&str] = &[
    "register",
    "audio",
    "transcription",
    "send_translation",
    "settings",
    "ping",
    "student_request",
    "teacher_reply",
];

/// Result of parsing one socket frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedFrame {
    /// A recognised envelope.
    Message(Inbound),
    /// A well-formed envelope with an unrecognised `type`.
    Unknown(String),
}

impl Inbound {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<ParsedFrame, RelayError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::validation(format!("invalid JSON: {e}")))?;
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(RelayError::validation("missing \"type\" field"));
        };
        if !INBOUND_TYPES.contains(&kind) {
            return Ok(ParsedFrame::Unknown(kind.to_owned()));
        }
        let kind = kind.to_owned();
        serde_json::from_value(value)
            .map(ParsedFrame::Message)
            .map_err(|e| RelayError::validation(format!("invalid {kind} message: {e}")))
    }

    /// Wire `type` of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Audio(_) => "audio",
            Self::Transcription { .. } => "transcription",
            Self::SendTranslation { .. } => "send_translation",
            Self::Settings { .. } => "settings",
            Self::Ping { .. } => "ping",
            Self::StudentRequest { .. } => "student_request",
            Self::TeacherReply { .. } => "teacher_reply",
        }
    }
}

/// Outbound envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// First frame on every socket.
    #[serde(rename_all = "camelCase")]
    Connection {
        /// Id assigned to this socket.
        connection_id: ConnectionId,
    },
    /// Presenter's join code.
    SessionCode {
        /// The code listeners enter.
        code: SessionCode,
    },
    /// Registration accepted.
    #[serde(rename_all = "camelCase")]
    RegistrationConfirmation {
        /// Role granted.
        role: Role,
        /// Language recorded for the connection.
        language_code: String,
        /// Session joined or owned.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_code: Option<SessionCode>,
    },
    /// Translated text for a listener.
    #[serde(rename_all = "camelCase")]
    Translation {
        /// Text in the target language.
        text: String,
        /// Text as the presenter produced it.
        original_text: String,
        /// Presenter language.
        source_language: String,
        /// Listener language.
        target_language: String,
        /// Base64 synthesized speech.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
    },
    /// Server-side transcription echoed to the presenter.
    Transcription {
        /// Recognized text.
        text: String,
        /// Whether manual mode withheld it from listeners.
        held: bool,
    },
    /// Number of listeners in the presenter's session.
    ListenerCount {
        /// Current listener count.
        count: usize,
    },
    /// Presenter settings after an update.
    SettingsUpdated {
        /// Effective settings.
        settings: SessionSettings,
    },
    /// Listener question forwarded to the presenter.
    #[serde(rename_all = "camelCase")]
    StudentRequest {
        /// Asking listener.
        connection_id: ConnectionId,
        /// Listener's display name, if given.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        /// Listener language.
        language_code: String,
        /// Question in the presenter's language.
        text: String,
        /// Question as asked.
        original_text: String,
    },
    /// Presenter answer delivered to one listener.
    #[serde(rename_all = "camelCase")]
    TeacherReply {
        /// Answer in the listener's language.
        text: String,
        /// Answer as written.
        original_text: String,
        /// Presenter language.
        source_language: String,
        /// Listener language.
        target_language: String,
    },
    /// Reply to an inbound `ping`.
    #[serde(rename_all = "camelCase")]
    Pong {
        /// Echoed client timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
        /// Server wall clock, ms since the Unix epoch.
        server_time: i64,
    },
    /// Failure report.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl Outbound {
    /// Build an `error` envelope from a relay error.
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
