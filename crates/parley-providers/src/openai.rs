//! OpenAI-compatible HTTP adapter.
//!
//! One client serves all three capabilities:
//! - `POST /v1/audio/transcriptions` (multipart, Whisper)
//! - `POST /v1/chat/completions` (translation prompt)
//! - `POST /v1/audio/speech` (speech synthesis, raw audio body)
//!
//! A missing API key fails each call with [`ProviderError::NotConfigured`]
//! so the chain moves on without a network round trip.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::traits::{
    Provider, SynthesizeOptions, Synthesizer, TranscribeOptions, Transcriber, TranslateOptions,
    Translator, primary_language,
};

/// Public API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
/// Environment variable read for the key when none is configured.
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_TRANSCRIBE_MODEL: &str = "whisper-1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_SPEECH_MODEL: &str = "tts-1";
const DEFAULT_VOICE: &str = "alloy";

/// Adapter settings.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Name in logs and metrics.
    pub name: String,
    /// API root, without the `/v1` suffix.
    pub base_url: String,
    /// Bearer token.
    pub api_key: Option<String>,
    /// Model override. Applies to whichever capability this instance serves.
    pub model: Option<String>,
    /// Voice for synthesis.
    pub voice: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            name: "openai".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: None,
            voice: None,
        }
    }
}

/// OpenAI-compatible provider.
pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    /// Build an adapter sharing `client`.
    pub fn new(config: OpenAiConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::NotConfigured {
                provider: self.config.name.clone(),
                message: "missing API key".into(),
            })
    }

    fn http_err(&self, source: reqwest::Error) -> ProviderError {
        ProviderError::Http {
            provider: self.config.name.clone(),
            source,
        }
    }

    fn invalid(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::InvalidResponse {
            provider: self.config.name.clone(),
            message: message.into(),
        }
    }

    /// Turn a non-success status into [`ProviderError::Api`].
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            provider: self.config.name.clone(),
            status: status.as_u16(),
            message: body,
        })
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }
}

#[async_trait]
impl Transcriber for OpenAiProvider {
    async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscribeOptions,
    ) -> Result<String, ProviderError> {
        let key = self.api_key()?;
        let mime = options.mime_type.as_deref().unwrap_or("audio/webm");
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(crate::sidecar::filename_for_mime(mime))
            .mime_str(mime)
            .map_err(|e| self.http_err(e))?;
        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_TRANSCRIBE_MODEL.to_string());
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model);
        if let Some(language) = options.language.as_deref() {
            form = form.text("language", primary_language(language));
        }

        debug!(provider = %self.config.name, bytes = audio.len(), "transcription request");
        let response = self
            .client
            .post(self.url("/v1/audio/transcriptions"))
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.http_err(e))?;
        let body: TranscriptionResponse = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.invalid(e.to_string()))?;
        Ok(body.text.trim().to_string())
    }
}

#[async_trait]
impl Translator for OpenAiProvider {
    async fn translate(
        &self,
        text: &str,
        options: &TranslateOptions,
    ) -> Result<String, ProviderError> {
        let key = self.api_key()?;
        let instruction = format!(
            "Translate the user's text from {} to {}. Reply with the translation only.",
            options.source, options.target
        );
        let request = json!({
            "model": self.config.model.as_deref().unwrap_or(DEFAULT_CHAT_MODEL),
            "temperature": 0,
            "messages": [
                {"role": "system", "content": instruction},
                {"role": "user", "content": text},
            ],
        });

        let response = self
            .client
            .post(self.url("/v1/chat/completions"))
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.http_err(e))?;
        let body: ChatResponse = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.invalid(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.invalid("empty completion"))
    }
}

#[async_trait]
impl Synthesizer for OpenAiProvider {
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesizeOptions,
    ) -> Result<Bytes, ProviderError> {
        let key = self.api_key()?;
        let voice = options
            .voice
            .as_deref()
            .or(self.config.voice.as_deref())
            .unwrap_or(DEFAULT_VOICE);
        let request = json!({
            "model": self.config.model.as_deref().unwrap_or(DEFAULT_SPEECH_MODEL),
            "voice": voice,
            "input": text,
            "response_format": "mp3",
        });

        let response = self
            .client
            .post(self.url("/v1/audio/speech"))
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.http_err(e))?;
        let audio = self
            .check(response)
            .await?
            .bytes()
            .await
            .map_err(|e| self.http_err(e))?;
        if audio.is_empty() {
            return Err(self.invalid("empty audio body"));
        }
        Ok(audio)
    }
}
