//! Scripted providers for deterministic tests without network calls.
//!
//! One [`MockProvider`] implements all three capability traits, so the same
//! instance can sit in any chain. Calls are counted and translation targets
//! are recorded for assertions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::ProviderError;
use crate::traits::{
    Provider, SynthesizeOptions, Synthesizer, TranscribeOptions, Transcriber, TranslateOptions,
    Translator,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Succeed,
    Fail,
    Hang,
}

/// Pre-programmed provider.
///
/// - transcribe returns the configured transcript (default `"mock transcript"`)
/// - translate returns `"[<target>] <text>"`
/// - synthesize returns the UTF-8 bytes of `"audio:<text>"`
pub struct MockProvider {
    name: String,
    mode: Mode,
    transcript: String,
    delay: Option<Duration>,
    fail_targets: Vec<String>,
    calls: AtomicUsize,
    translations: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    /// Provider that succeeds on every call.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Succeed,
            transcript: "mock transcript".to_string(),
            delay: None,
            fail_targets: Vec::new(),
            calls: AtomicUsize::new(0),
            translations: Mutex::new(Vec::new()),
        }
    }

    /// Fail every call.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.mode = Mode::Fail;
        self
    }

    /// Never complete (exercises timeouts and cancellation).
    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.mode = Mode::Hang;
        self
    }

    /// Text returned by transcribe.
    #[must_use]
    pub fn with_transcript(mut self, text: impl Into<String>) -> Self {
        self.transcript = text.into();
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail translations into this target language only.
    #[must_use]
    pub fn failing_for(mut self, target: impl Into<String>) -> Self {
        self.fail_targets.push(target.into());
        self
    }

    /// Total calls across all capabilities.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(text, target)` of every translate call, in order.
    pub fn translations(&self) -> Vec<(String, String)> {
        self.translations.lock().clone()
    }

    async fn enter(&self) -> Result<(), ProviderError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.mode {
            Mode::Succeed => Ok(()),
            Mode::Fail => Err(ProviderError::other(&self.name, "scripted failure")),
            Mode::Hang => std::future::pending().await,
        }
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transcriber for MockProvider {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _options: &TranscribeOptions,
    ) -> Result<String, ProviderError> {
        self.enter().await?;
        Ok(self.transcript.clone())
    }
}

#[async_trait]
impl Translator for MockProvider {
    async fn translate(
        &self,
        text: &str,
        options: &TranslateOptions,
    ) -> Result<String, ProviderError> {
        self.translations
            .lock()
            .push((text.to_string(), options.target.clone()));
        self.enter().await?;
        if self.fail_targets.iter().any(|t| t == &options.target) {
            return Err(ProviderError::other(
                &self.name,
                format!("scripted failure for {}", options.target),
            ));
        }
        Ok(format!("[{}] {text}", options.target))
    }
}

#[async_trait]
impl Synthesizer for MockProvider {
    async fn synthesize(
        &self,
        text: &str,
        _options: &SynthesizeOptions,
    ) -> Result<Bytes, ProviderError> {
        self.enter().await?;
        Ok(Bytes::from(format!("audio:{text}")))
    }
}
