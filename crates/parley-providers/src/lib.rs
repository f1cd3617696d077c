//! # parley-providers
//!
//! External speech, translation, and synthesis services behind one
//! interface per capability, plus the ordered fallback chain that tries
//! them in turn.
//!
//! - [`traits`]: [`Transcriber`], [`Translator`], [`Synthesizer`]
//! - [`chain`]: [`FallbackChain`] and the bundled [`ProviderChain`]
//! - [`health`]: recent failure ratio per provider
//! - [`openai`], [`sidecar`], [`passthrough`]: concrete adapters
//! - [`factory`]: build a [`ProviderChain`] from settings
//! - `mock` (feature `test-util`): scripted providers for tests

#![deny(unsafe_code)]

pub mod chain;
pub mod error;
pub mod factory;
pub mod health;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod openai;
pub mod passthrough;
pub mod sidecar;
pub mod traits;

pub use chain::{FallbackChain, ProviderChain, ProviderOutcome};
pub use error::{AttemptFailure, ChainError, ProviderError};
pub use factory::build_provider_chain;
pub use health::{HealthPolicy, ProviderHealthTracker};
pub use traits::{
    Capability, Provider, SynthesizeOptions, Synthesizer, TranscribeOptions, Transcriber,
    TranslateOptions, Translator,
};
