//! Identifier newtypes.
//!
//! [`ConnectionId`] is opaque and unique per socket (UUID v7, time-ordered).
//! [`SessionCode`] is the short code a listener types to join a presenter:
//! six characters drawn from `[A-Z0-9]`.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{SESSION_CODE_ALPHABET, SESSION_CODE_LEN};

/// Unique id of one live socket connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new random id (`conn_` + UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7().simple()))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Six-character join code over `[A-Z0-9]`.
///
/// Codes are case-insensitive on input: [`SessionCode::parse`] trims and
/// upper-cases before validating.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Draw a random code from `rng`.
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let code = (0..SESSION_CODE_LEN)
            .map(|_| {
                let idx = rng.random_range(0..SESSION_CODE_ALPHABET.len());
                char::from(SESSION_CODE_ALPHABET[idx])
            })
            .collect();
        Self(code)
    }

    /// Draw a random code from the thread-local generator.
    #[must_use]
    pub fn random() -> Self {
        Self::generate(&mut rand::rng())
    }

    /// Validate user input as a session code.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_ascii_uppercase();
        Self::is_valid(&normalized).then_some(Self(normalized))
    }

    /// Whether `s` is exactly six characters of `[A-Z0-9]`.
    pub fn is_valid(s: &str) -> bool {
        s.len() == SESSION_CODE_LEN && s.bytes().all(|b| SESSION_CODE_ALPHABET.contains(&b))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid session code: {value:?}"))
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

impl AsRef<str> for SessionCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
