//! Self-hosted sidecar adapter.
//!
//! The sidecar is a local HTTP service exposing:
//! - `POST /transcribe`: multipart `audio` (+ optional `language`) → `{"text"}`
//! - `POST /translate`: `{"text","source","target"}` → `{"text"}`
//! - `POST /synthesize`: `{"text","language","voice"}` → raw audio body

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use crate::error::ProviderError;
use crate::traits::{
    Provider, SynthesizeOptions, Synthesizer, TranscribeOptions, Transcriber, TranslateOptions,
    Translator,
};

/// Where the sidecar listens when no URL is configured.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8765";

/// Map a MIME type to a filename with the right extension.
///
/// Audio decoders pick the container from the extension; sending m4a as
/// `.wav` fails with "file does not start with RIFF id".
pub fn filename_for_mime(mime_type: &str) -> String {
    let ext = match mime_type {
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/aac" => "m4a",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/ogg" | "audio/vorbis" => "ogg",
        "audio/webm" => "webm",
        "audio/flac" | "audio/x-flac" => "flac",
        _ => "wav",
    };
    format!("audio.{ext}")
}

#[derive(Deserialize)]
struct TextResponse {
    #[serde(alias = "translation")]
    text: String,
}

/// Sidecar provider.
pub struct SidecarProvider {
    name: String,
    base_url: String,
    voice: Option<String>,
    client: reqwest::Client,
}

impl SidecarProvider {
    /// Build an adapter sharing `client`.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        voice: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            voice,
            client,
        }
    }

    fn http_err(&self, source: reqwest::Error) -> ProviderError {
        ProviderError::Http {
            provider: self.name.clone(),
            source,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = request.send().await.map_err(|e| self.http_err(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: self.name.clone(),
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(response)
    }

    async fn read_text(&self, response: reqwest::Response) -> Result<String, ProviderError> {
        let body: TextResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.name.clone(),
                    message: e.to_string(),
                })?;
        Ok(body.text.trim().to_string())
    }
}

impl Provider for SidecarProvider {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transcriber for SidecarProvider {
    async fn transcribe(
        &self,
        audio: &[u8],
        options: &TranscribeOptions,
    ) -> Result<String, ProviderError> {
        let mime = options.mime_type.as_deref().unwrap_or("audio/wav");
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(filename_for_mime(mime))
            .mime_str(mime)
            .map_err(|e| self.http_err(e))?;
        let mut form = reqwest::multipart::Form::new().part("audio", part);
        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .send(
                self.client
                    .post(format!("{}/transcribe", self.base_url))
                    .multipart(form),
            )
            .await?;
        self.read_text(response).await
    }
}

#[async_trait]
impl Translator for SidecarProvider {
    async fn translate(
        &self,
        text: &str,
        options: &TranslateOptions,
    ) -> Result<String, ProviderError> {
        let response = self
            .send(
                self.client
                    .post(format!("{}/translate", self.base_url))
                    .json(&json!({
                        "text": text,
                        "source": options.source,
                        "target": options.target,
                    })),
            )
            .await?;
        self.read_text(response).await
    }
}

#[async_trait]
impl Synthesizer for SidecarProvider {
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesizeOptions,
    ) -> Result<Bytes, ProviderError> {
        let voice = options.voice.as_ref().or(self.voice.as_ref());
        let response = self
            .send(
                self.client
                    .post(format!("{}/synthesize", self.base_url))
                    .json(&json!({
                        "text": text,
                        "language": options.language,
                        "voice": voice,
                    })),
            )
            .await?;
        response.bytes().await.map_err(|e| self.http_err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sidecar(server: &MockServer) -> SidecarProvider {
        SidecarProvider::new("sidecar", server.uri(), None, reqwest::Client::new())
    }

    #[test]
    fn filename_for_mime_variants() {
        assert_eq!(filename_for_mime("audio/x-m4a"), "audio.m4a");
        assert_eq!(filename_for_mime("audio/mpeg"), "audio.mp3");
        assert_eq!(filename_for_mime("audio/webm"), "audio.webm");
        assert_eq!(filename_for_mime("application/octet-stream"), "audio.wav");
    }

    #[tokio::test]
    async fn transcribe_reads_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"text": "hola", "language": "es"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let text = sidecar(&server)
            .transcribe(b"data", &TranscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "hola");
    }

    #[tokio::test]
    async fn translate_sends_languages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .and(body_json(json!({"text": "Hello", "source": "en", "target": "de"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"translation": "Hallo"})))
            .mount(&server)
            .await;

        let text = sidecar(&server)
            .translate(
                "Hello",
                &TranslateOptions {
                    source: "en".into(),
                    target: "de".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(text, "Hallo");
    }

    #[tokio::test]
    async fn server_error_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/synthesize"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let err = sidecar(&server)
            .synthesize("x", &SynthesizeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 500, .. }));
        assert_eq!(err.provider(), "sidecar");
    }

    #[tokio::test]
    async fn unreachable_sidecar_is_http_error() {
        // Port 9 (discard) is never served in the test environment.
        let provider =
            SidecarProvider::new("local", "http://127.0.0.1:9", None, reqwest::Client::new());
        let err = provider
            .transcribe(b"x", &TranscribeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "network");
    }
}
