//! Provider traits, one per capability.
//!
//! Every implementor must be `Send + Sync`: chains hold providers as
//! `Arc<dyn Trait>` and call them from any connection's pipeline task.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// What a chain produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Speech to text.
    Transcribe,
    /// Text to text in another language.
    Translate,
    /// Text to speech.
    Synthesize,
}

impl Capability {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Translate => "translate",
            Self::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common identity of every provider.
pub trait Provider: Send + Sync {
    /// Name used in errors, logs, and metrics (e.g. `"openai"`).
    fn name(&self) -> &str;
}

/// Options for a transcription call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TranscribeOptions {
    /// BCP-47 language of the speaker, if known.
    pub language: Option<String>,
    /// Container MIME type of the audio.
    pub mime_type: Option<String>,
}

/// Options for a translation call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslateOptions {
    /// BCP-47 language of the input.
    pub source: String,
    /// BCP-47 language wanted.
    pub target: String,
}

/// Options for a synthesis call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SynthesizeOptions {
    /// BCP-47 language of the text.
    pub language: String,
    /// Voice override.
    pub voice: Option<String>,
}

/// Speech-to-text provider.
#[async_trait]
pub trait Transcriber: Provider {
    /// Transcribe one complete utterance.
    async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscribeOptions,
    ) -> Result<String, ProviderError>;
}

/// Text translation provider.
#[async_trait]
pub trait Translator: Provider {
    /// Translate `text` from `options.source` to `options.target`.
    async fn translate(
        &self,
        text: &str,
        options: &TranslateOptions,
    ) -> Result<String, ProviderError>;
}

/// Speech synthesis provider.
#[async_trait]
pub trait Synthesizer: Provider {
    /// Render `text` as encoded audio.
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesizeOptions,
    ) -> Result<Bytes, ProviderError>;
}

/// Primary subtag of a BCP-47 tag (`"es-ES"` → `"es"`), lower-cased.
pub fn primary_language(tag: &str) -> String {
    tag.split(['-', '_'])
        .next()
        .unwrap_or(tag)
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_labels() {
        assert_eq!(Capability::Transcribe.to_string(), "transcribe");
        assert_eq!(Capability::Translate.as_str(), "translate");
        assert_eq!(
            serde_json::to_value(Capability::Synthesize).unwrap(),
            "synthesize"
        );
    }

    #[test]
    fn primary_language_subtag() {
        assert_eq!(primary_language("es-ES"), "es");
        assert_eq!(primary_language("zh_Hant_TW"), "zh");
        assert_eq!(primary_language("EN"), "en");
        assert_eq!(primary_language(""), "");
    }
}
