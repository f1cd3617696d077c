//! Translation fan-out to a session's listeners.
//!
//! Listeners are grouped by language so each distinct language costs one
//! translation (and one synthesis when enabled). The resulting envelope is
//! encoded once and shared by every listener of that language. A listener
//! whose socket is gone is skipped without affecting the others.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use parley_core::{ConnectionId, Outbound, RelayError, SessionCode};
use parley_providers::{ChainError, ProviderChain, SynthesizeOptions, TranslateOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::directory::SessionDirectory;
use crate::metrics::{BROADCAST_DROPS_TOTAL, BROADCASTS_TOTAL};
use crate::registry::ConnectionRegistry;

/// What one broadcast did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Distinct listener languages in the session.
    pub languages: usize,
    /// Envelopes queued to listeners.
    pub delivered: usize,
    /// Listeners skipped because their socket was gone or full.
    pub skipped: usize,
    /// Languages whose translation chain was exhausted.
    pub failed_languages: Vec<String>,
}

impl BroadcastReport {
    /// Error for the presenter when some languages could not be served.
    pub fn exhaustion_error(&self) -> Option<RelayError> {
        if self.failed_languages.is_empty() {
            return None;
        }
        Some(RelayError::ProviderChainExhausted {
            message: format!(
                "translation unavailable for {}",
                self.failed_languages.join(", ")
            ),
        })
    }
}

/// Translate `text` unless the languages already match.
pub async fn translate_text(
    chain: &ProviderChain,
    text: &str,
    source: &str,
    target: &str,
    cancel: &CancellationToken,
) -> Result<String, ChainError> {
    if source.eq_ignore_ascii_case(target) {
        return Ok(text.to_owned());
    }
    let options = TranslateOptions {
        source: source.to_owned(),
        target: target.to_owned(),
    };
    chain
        .translate(text, &options, cancel)
        .await
        .map(|outcome| outcome.value)
}

enum LanguageResult {
    Ready(Arc<str>),
    Failed,
    Cancelled,
}

/// Fans presenter text out to listeners.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<SessionDirectory>,
    chain: Arc<ProviderChain>,
}

impl Broadcaster {
    /// New broadcaster over shared state.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<SessionDirectory>,
        chain: Arc<ProviderChain>,
    ) -> Self {
        Self {
            registry,
            directory,
            chain,
        }
    }

    /// The provider chain.
    pub fn chain(&self) -> &Arc<ProviderChain> {
        &self.chain
    }

    /// Translate `text` for every listener language in `code` and deliver.
    ///
    /// Fails with `SESSION_NOT_FOUND` if the session is gone and with
    /// `CONNECTION_LOST` if `cancel` fires first. Languages whose chain is
    /// exhausted are listed in the report; the rest are still delivered.
    pub async fn broadcast(
        &self,
        code: &SessionCode,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<BroadcastReport, RelayError> {
        let session = self
            .directory
            .session(code)
            .ok_or_else(|| RelayError::session_not_found(code.as_str()))?;
        let groups = session.listeners_by_language();
        let mut report = BroadcastReport {
            languages: groups.len(),
            ..BroadcastReport::default()
        };
        if groups.is_empty() {
            debug!(session_code = %code, "no listeners, nothing to broadcast");
            return Ok(report);
        }

        let source = session.source_language.as_str();
        let with_audio = session.settings.tts_enabled && self.chain.can_synthesize();
        let prepared = join_all(
            groups
                .keys()
                .map(|language| self.prepare(text, source, language, with_audio, cancel)),
        )
        .await;

        for ((language, listeners), result) in groups.iter().zip(prepared) {
            match result {
                LanguageResult::Ready(json) => {
                    for id in listeners {
                        if self.deliver(id, Arc::clone(&json)) {
                            report.delivered += 1;
                        } else {
                            report.skipped += 1;
                        }
                    }
                }
                LanguageResult::Failed => report.failed_languages.push(language.clone()),
                LanguageResult::Cancelled => return Err(RelayError::ConnectionLost),
            }
        }

        metrics::counter!(BROADCASTS_TOTAL).increment(1);
        debug!(
            session_code = %code,
            languages = report.languages,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed_languages.len(),
            "broadcast complete"
        );
        Ok(report)
    }

    async fn prepare(
        &self,
        text: &str,
        source: &str,
        language: &str,
        with_audio: bool,
        cancel: &CancellationToken,
    ) -> LanguageResult {
        let translated = match translate_text(&self.chain, text, source, language, cancel).await {
            Ok(translated) => translated,
            Err(e) if e.is_cancelled() => return LanguageResult::Cancelled,
            Err(e) => {
                warn!(language, error = %e, "translation failed for language");
                return LanguageResult::Failed;
            }
        };

        let audio = if with_audio {
            self.synthesize(&translated, language, cancel).await
        } else {
            None
        };

        let message = Outbound::Translation {
            text: translated,
            original_text: text.to_owned(),
            source_language: source.to_owned(),
            target_language: language.to_owned(),
            audio,
        };
        match message.encode() {
            Ok(json) => LanguageResult::Ready(Arc::from(json)),
            Err(e) => {
                warn!(language, error = %e, "failed to encode translation");
                LanguageResult::Failed
            }
        }
    }

    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let options = SynthesizeOptions {
            language: language.to_owned(),
            voice: None,
        };
        match self.chain.synthesize(text, &options, cancel).await {
            Ok(outcome) => Some(STANDARD.encode(&outcome.value)),
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(language, error = %e, "synthesis failed, sending text only");
                }
                None
            }
        }
    }

    fn deliver(&self, id: &ConnectionId, json: Arc<str>) -> bool {
        let Some(connection) = self.registry.get(id) else {
            debug!(connection_id = %id, "listener gone, skipping");
            metrics::counter!(BROADCAST_DROPS_TOTAL, "reason" => "gone").increment(1);
            return false;
        };
        if connection.send_text(json) {
            true
        } else {
            warn!(connection_id = %id, "listener unreachable, skipping");
            metrics::counter!(BROADCAST_DROPS_TOTAL, "reason" => "unreachable").increment(1);
            false
        }
    }
}
