//! Offline translator that returns its input unchanged.
//!
//! Useful as the last link of a translate chain so listeners still get the
//! presenter's words when every remote service is down.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::traits::{Provider, TranslateOptions, Translator};

/// Identity translator.
#[derive(Clone, Debug)]
pub struct PassthroughTranslator {
    name: String,
}

impl PassthroughTranslator {
    /// Named instance.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for PassthroughTranslator {
    fn default() -> Self {
        Self::new("passthrough")
    }
}

impl Provider for PassthroughTranslator {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Translator for PassthroughTranslator {
    async fn translate(
        &self,
        text: &str,
        _options: &TranslateOptions,
    ) -> Result<String, ProviderError> {
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_input() {
        let t = PassthroughTranslator::default();
        let out = t
            .translate(
                "Bonjour",
                &TranslateOptions {
                    source: "fr".into(),
                    target: "en".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(out, "Bonjour");
        assert_eq!(t.name(), "passthrough");
    }
}
