//! Relay error taxonomy and wire error codes.

use crate::constants::CLOSE_POLICY_VIOLATION;

// ── Error code constants ────────────────────────────────────────────

/// Malformed envelope or missing/invalid fields.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// A steady-state message arrived before `register`.
pub const NOT_REGISTERED: &str = "NOT_REGISTERED";
/// The sender's role may not send this message.
pub const FORBIDDEN: &str = "FORBIDDEN";
/// The session code is unknown or the session has expired.
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
/// No unique session code could be minted.
pub const CODE_GENERATION_EXHAUSTED: &str = "CODE_GENERATION_EXHAUSTED";
/// Every provider for a capability failed.
pub const PROVIDER_CHAIN_EXHAUSTED: &str = "PROVIDER_CHAIN_EXHAUSTED";
/// The connection went away mid-operation.
pub const CONNECTION_LOST: &str = "CONNECTION_LOST";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Errors surfaced to clients as `error` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Malformed or missing envelope fields.
    #[error("{message}")]
    Validation {
        /// Human-readable description.
        message: String,
    },

    /// Message requires a prior `register`.
    #[error("connection must register before sending {kind}")]
    NotRegistered {
        /// Envelope type that was rejected.
        kind: String,
    },

    /// Message not permitted for the sender's role.
    #[error("{message}")]
    Forbidden {
        /// Human-readable description.
        message: String,
    },

    /// Unknown or expired session.
    #[error("session {code} not found")]
    SessionNotFound {
        /// The code that failed to resolve.
        code: String,
    },

    /// Code minting collided on every attempt.
    #[error("could not generate a unique session code after {attempts} attempts")]
    CodeGenerationExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// All providers for a capability failed.
    #[error("{message}")]
    ProviderChainExhausted {
        /// Human-readable description.
        message: String,
    },

    /// The socket closed while work was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// Anything else.
    #[error("{message}")]
    Internal {
        /// Human-readable description.
        message: String,
    },
}

impl RelayError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a role violation.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Shorthand for an unknown session.
    pub fn session_not_found(code: impl Into<String>) -> Self {
        Self::SessionNotFound { code: code.into() }
    }

    /// Stable machine-readable code sent on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => VALIDATION_ERROR,
            Self::NotRegistered { .. } => NOT_REGISTERED,
            Self::Forbidden { .. } => FORBIDDEN,
            Self::SessionNotFound { .. } => SESSION_NOT_FOUND,
            Self::CodeGenerationExhausted { .. } => CODE_GENERATION_EXHAUSTED,
            Self::ProviderChainExhausted { .. } => PROVIDER_CHAIN_EXHAUSTED,
            Self::ConnectionLost => CONNECTION_LOST,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Close code to apply when this error ends a registration attempt.
    ///
    /// Registration failures for listeners (unknown code) and malformed
    /// registrations are policy violations; everything else keeps the
    /// socket open.
    pub fn registration_close_code(&self) -> Option<u16> {
        match self {
            Self::Validation { .. } | Self::SessionNotFound { .. } => Some(CLOSE_POLICY_VIOLATION),
            _ => None,
        }
    }
}
