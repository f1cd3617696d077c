//! Build the shared [`ProviderChain`] from settings.
//!
//! Called once at startup; the result is injected into the server.

use std::sync::Arc;
use std::time::Duration;

use parley_settings::{ProviderEntry, ProviderKind, ProvidersSettings};
use tracing::{info, warn};

use crate::chain::ProviderChain;
use crate::health::ProviderHealthTracker;
use crate::openai::{self, OpenAiConfig, OpenAiProvider};
use crate::passthrough::PassthroughTranslator;
use crate::sidecar::{self, SidecarProvider};
use crate::traits::{Capability, Synthesizer, Transcriber, Translator};

/// Build chains reading API keys from the process environment.
pub fn build_provider_chain(
    settings: &ProvidersSettings,
    health: Arc<ProviderHealthTracker>,
) -> ProviderChain {
    build_provider_chain_with(settings, health, |name| std::env::var(name).ok())
}

/// Build chains with an explicit key lookup.
pub fn build_provider_chain_with<F>(
    settings: &ProvidersSettings,
    health: Arc<ProviderHealthTracker>,
    lookup_env: F,
) -> ProviderChain
where
    F: Fn(&str) -> Option<String>,
{
    let client = reqwest::Client::new();

    let transcribers: Vec<Arc<dyn Transcriber>> = settings
        .transcribe
        .iter()
        .filter_map(|entry| -> Option<Arc<dyn Transcriber>> {
            match entry.kind {
                ProviderKind::Openai => Some(Arc::new(openai_for(entry, &client, &lookup_env))),
                ProviderKind::Sidecar => Some(Arc::new(sidecar_for(entry, &client))),
                ProviderKind::Passthrough => {
                    unsupported(Capability::Transcribe, entry);
                    None
                }
            }
        })
        .collect();

    let translators: Vec<Arc<dyn Translator>> = settings
        .translate
        .iter()
        .map(|entry| -> Arc<dyn Translator> {
            match entry.kind {
                ProviderKind::Openai => Arc::new(openai_for(entry, &client, &lookup_env)),
                ProviderKind::Sidecar => Arc::new(sidecar_for(entry, &client)),
                ProviderKind::Passthrough => {
                    Arc::new(PassthroughTranslator::new(entry.display_name()))
                }
            }
        })
        .collect();

    let synthesizers: Vec<Arc<dyn Synthesizer>> = settings
        .synthesize
        .iter()
        .filter_map(|entry| -> Option<Arc<dyn Synthesizer>> {
            match entry.kind {
                ProviderKind::Openai => Some(Arc::new(openai_for(entry, &client, &lookup_env))),
                ProviderKind::Sidecar => Some(Arc::new(sidecar_for(entry, &client))),
                ProviderKind::Passthrough => {
                    unsupported(Capability::Synthesize, entry);
                    None
                }
            }
        })
        .collect();

    let chain = ProviderChain::new(
        transcribers,
        translators,
        synthesizers,
        Duration::from_millis(settings.per_call_timeout_ms),
        health,
    );
    for (capability, names) in chain.describe() {
        if names.is_empty() {
            warn!(%capability, "no providers configured");
        } else {
            info!(%capability, providers = ?names, "provider chain ready");
        }
    }
    chain
}

fn openai_for<F>(entry: &ProviderEntry, client: &reqwest::Client, lookup_env: &F) -> OpenAiProvider
where
    F: Fn(&str) -> Option<String>,
{
    let key_env = entry
        .api_key_env
        .as_deref()
        .unwrap_or(openai::DEFAULT_API_KEY_ENV);
    let api_key = lookup_env(key_env);
    if api_key.is_none() {
        warn!(provider = %entry.display_name(), key_env, "API key not set; provider will be skipped at call time");
    }
    OpenAiProvider::new(
        OpenAiConfig {
            name: entry.display_name(),
            base_url: entry
                .base_url
                .clone()
                .unwrap_or_else(|| openai::DEFAULT_BASE_URL.to_string()),
            api_key,
            model: entry.model.clone(),
            voice: entry.voice.clone(),
        },
        client.clone(),
    )
}

fn sidecar_for(entry: &ProviderEntry, client: &reqwest::Client) -> SidecarProvider {
    SidecarProvider::new(
        entry.display_name(),
        entry
            .base_url
            .clone()
            .unwrap_or_else(|| sidecar::DEFAULT_BASE_URL.to_string()),
        entry.voice.clone(),
        client.clone(),
    )
}

fn unsupported(capability: Capability, entry: &ProviderEntry) {
    warn!(%capability, provider = %entry.display_name(), "provider kind does not support capability, skipping");
}
