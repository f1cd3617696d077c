//! Ordered fallback over interchangeable providers.
//!
//! [`FallbackChain::run`] tries each provider in configured order with a
//! bounded per-call timeout. The first success wins and later providers are
//! never invoked. A failure or timeout is recorded and the next provider is
//! tried; when none is left the caller gets exactly one
//! [`ChainError::Exhausted`]. Nothing is cached: every call starts again
//! from the front of the list.
//!
//! A [`CancellationToken`] tied to the owning connection aborts the walk
//! (including an in-flight call) with [`ChainError::Cancelled`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AttemptFailure, ChainError, ProviderError};
use crate::health::ProviderHealthTracker;
use crate::traits::{
    Capability, Provider, SynthesizeOptions, Synthesizer, TranscribeOptions, Transcriber,
    TranslateOptions, Translator,
};

/// Counter of provider attempts, labelled by capability, provider, and outcome.
pub const PROVIDER_ATTEMPTS_TOTAL: &str = "provider_attempts_total";
/// Histogram of provider call latency in seconds.
pub const PROVIDER_LATENCY_SECONDS: &str = "provider_latency_seconds";
/// Counter of chain invocations where every provider failed.
pub const PROVIDER_CHAIN_EXHAUSTED_TOTAL: &str = "provider_chain_exhausted_total";

/// Successful chain result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderOutcome<T> {
    /// What the provider produced.
    pub value: T,
    /// Provider that produced it.
    pub provider: String,
    /// Time spent in the winning call.
    pub latency: Duration,
}

/// Ordered providers for one capability.
pub struct FallbackChain<P: ?Sized> {
    capability: Capability,
    providers: Vec<Arc<P>>,
    timeout: Duration,
    health: Arc<ProviderHealthTracker>,
}

impl<P: ?Sized + Provider> FallbackChain<P> {
    /// Build a chain. `providers` are tried front to back.
    pub fn new(
        capability: Capability,
        providers: Vec<Arc<P>>,
        timeout: Duration,
        health: Arc<ProviderHealthTracker>,
    ) -> Self {
        Self {
            capability,
            providers,
            timeout,
            health,
        }
    }

    /// Capability this chain serves.
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Number of configured providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is configured.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider names in order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Walk the chain, calling `call` once per provider until one succeeds.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<ProviderOutcome<T>, ChainError>
    where
        F: FnMut(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let capability = self.capability.as_str();
        let mut attempts = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled {
                    capability: self.capability,
                });
            }

            let name = provider.name().to_string();
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(capability, provider = %name, "provider call cancelled");
                    return Err(ChainError::Cancelled { capability: self.capability });
                }
                r = tokio::time::timeout(self.timeout, call(Arc::clone(provider))) => r,
            };
            let latency = started.elapsed();

            let result = result.unwrap_or_else(|_| {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.timeout.as_millis() as u64;
                Err(ProviderError::Timeout {
                    provider: name.clone(),
                    timeout_ms,
                })
            });

            metrics::histogram!(
                PROVIDER_LATENCY_SECONDS,
                "capability" => capability,
                "provider" => name.clone()
            )
            .record(latency.as_secs_f64());

            match result {
                Ok(value) => {
                    self.health.record_success(&name);
                    metrics::counter!(
                        PROVIDER_ATTEMPTS_TOTAL,
                        "capability" => capability,
                        "provider" => name.clone(),
                        "outcome" => "success"
                    )
                    .increment(1);
                    debug!(
                        capability,
                        provider = %name,
                        latency_ms = latency.as_millis(),
                        failed_before = attempts.len(),
                        "provider call succeeded"
                    );
                    return Ok(ProviderOutcome {
                        value,
                        provider: name,
                        latency,
                    });
                }
                Err(err) => {
                    self.health.record_failure(&name);
                    metrics::counter!(
                        PROVIDER_ATTEMPTS_TOTAL,
                        "capability" => capability,
                        "provider" => name.clone(),
                        "outcome" => err.category()
                    )
                    .increment(1);
                    warn!(capability, provider = %name, error = %err, "provider call failed");
                    attempts.push(AttemptFailure::from(&err));
                }
            }
        }

        metrics::counter!(PROVIDER_CHAIN_EXHAUSTED_TOTAL, "capability" => capability).increment(1);
        warn!(capability, attempts = attempts.len(), "provider chain exhausted");
        Err(ChainError::Exhausted {
            capability: self.capability,
            attempts,
        })
    }
}

/// The three capability chains, built once at startup and shared.
pub struct ProviderChain {
    transcribe: FallbackChain<dyn Transcriber>,
    translate: FallbackChain<dyn Translator>,
    synthesize: FallbackChain<dyn Synthesizer>,
    health: Arc<ProviderHealthTracker>,
}

impl ProviderChain {
    /// Assemble chains from ordered provider lists.
    pub fn new(
        transcribers: Vec<Arc<dyn Transcriber>>,
        translators: Vec<Arc<dyn Translator>>,
        synthesizers: Vec<Arc<dyn Synthesizer>>,
        timeout: Duration,
        health: Arc<ProviderHealthTracker>,
    ) -> Self {
        Self {
            transcribe: FallbackChain::new(
                Capability::Transcribe,
                transcribers,
                timeout,
                Arc::clone(&health),
            ),
            translate: FallbackChain::new(
                Capability::Translate,
                translators,
                timeout,
                Arc::clone(&health),
            ),
            synthesize: FallbackChain::new(
                Capability::Synthesize,
                synthesizers,
                timeout,
                Arc::clone(&health),
            ),
            health,
        }
    }

    /// Speech to text.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscribeOptions,
        cancel: &CancellationToken,
    ) -> Result<ProviderOutcome<String>, ChainError> {
        self.transcribe
            .run(cancel, move |p| async move { p.transcribe(audio, options).await })
            .await
    }

    /// Text translation.
    pub async fn translate(
        &self,
        text: &str,
        options: &TranslateOptions,
        cancel: &CancellationToken,
    ) -> Result<ProviderOutcome<String>, ChainError> {
        self.translate
            .run(cancel, move |p| async move { p.translate(text, options).await })
            .await
    }

    /// Text to speech.
    pub async fn synthesize(
        &self,
        text: &str,
        options: &SynthesizeOptions,
        cancel: &CancellationToken,
    ) -> Result<ProviderOutcome<Bytes>, ChainError> {
        self.synthesize
            .run(cancel, move |p| async move { p.synthesize(text, options).await })
            .await
    }

    /// Whether any synthesizer is configured.
    pub fn can_synthesize(&self) -> bool {
        !self.synthesize.is_empty()
    }

    /// Shared health tracker.
    pub fn health(&self) -> &Arc<ProviderHealthTracker> {
        &self.health
    }

    /// Provider names per capability, for startup logging.
    pub fn describe(&self) -> Vec<(Capability, Vec<String>)> {
        vec![
            (Capability::Transcribe, self.transcribe.provider_names()),
            (Capability::Translate, self.translate.provider_names()),
            (Capability::Synthesize, self.synthesize.provider_names()),
        ]
    }
}

impl std::fmt::Debug for ProviderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderChain")
            .field("transcribe", &self.transcribe.provider_names())
            .field("translate", &self.translate.provider_names())
            .field("synthesize", &self.synthesize.provider_names())
            .finish_non_exhaustive()
    }
}
