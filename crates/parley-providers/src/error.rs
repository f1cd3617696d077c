//! Provider and chain errors.

use std::fmt;

use crate::traits::Capability;

/// Failure of a single provider call. Always names the provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport-level HTTP failure.
    #[error("{provider}: HTTP error: {source}")]
    Http {
        /// Provider name.
        provider: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-success status.
    #[error("{provider}: API error ({status}): {message}")]
    Api {
        /// Provider name.
        provider: String,
        /// HTTP status code.
        status: u16,
        /// Response body or description.
        message: String,
    },

    /// The response could not be interpreted.
    #[error("{provider}: invalid response: {message}")]
    InvalidResponse {
        /// Provider name.
        provider: String,
        /// Error description.
        message: String,
    },

    /// The call exceeded the per-call timeout.
    #[error("{provider}: timed out after {timeout_ms}ms")]
    Timeout {
        /// Provider name.
        provider: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Missing credentials or unsupported capability.
    #[error("{provider}: not configured: {message}")]
    NotConfigured {
        /// Provider name.
        provider: String,
        /// Error description.
        message: String,
    },

    /// Anything else.
    #[error("{provider}: {message}")]
    Other {
        /// Provider name.
        provider: String,
        /// Error description.
        message: String,
    },
}

impl ProviderError {
    /// Name of the provider that failed.
    pub fn provider(&self) -> &str {
        match self {
            Self::Http { provider, .. }
            | Self::Api { provider, .. }
            | Self::InvalidResponse { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::NotConfigured { provider, .. }
            | Self::Other { provider, .. } => provider,
        }
    }

    /// Error category for logs and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Http { .. } => "network",
            Self::Api { .. } => "api",
            Self::InvalidResponse { .. } => "parse",
            Self::Timeout { .. } => "timeout",
            Self::NotConfigured { .. } => "config",
            Self::Other { .. } => "unknown",
        }
    }

    /// Shorthand for [`ProviderError::Other`].
    pub fn other(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Other {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// One failed attempt recorded while walking a chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Provider that was tried.
    pub provider: String,
    /// Error category.
    pub category: &'static str,
    /// Rendered error.
    pub message: String,
}

impl From<&ProviderError> for AttemptFailure {
    fn from(err: &ProviderError) -> Self {
        Self {
            provider: err.provider().to_string(),
            category: err.category(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.provider, self.category)
    }
}

/// Failure of a whole chain invocation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Every provider failed (or the chain is empty).
    #[error("all {capability} providers failed{}", render_attempts(.attempts))]
    Exhausted {
        /// Capability that was requested.
        capability: Capability,
        /// Failures in the order they happened.
        attempts: Vec<AttemptFailure>,
    },

    /// The owning connection went away before a provider succeeded.
    #[error("{capability} cancelled")]
    Cancelled {
        /// Capability that was requested.
        capability: Capability,
    },
}

fn render_attempts(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return " (no providers configured)".to_string();
    }
    let names: Vec<String> = attempts.iter().map(ToString::to_string).collect();
    format!(": {}", names.join(", "))
}

impl ChainError {
    /// Whether this is a cancellation rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
