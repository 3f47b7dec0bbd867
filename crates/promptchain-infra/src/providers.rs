//! Environment-driven provider factory.
//!
//! Implements the engine's [`ProviderSource`] seam: provider names resolve
//! to cached [`ProviderHandle`]s constructed from process environment:
//!
//! - `openai` -- requires `OPENAI_API_KEY`; supports sync + batch.
//! - `ollama` -- `OLLAMA_BASE_URL`, defaulting to `http://localhost:11434`;
//!   sync only.
//!
//! There is no implicit fallback between providers: an unknown name or a
//! missing key is an error, never a substitution.

use std::sync::Arc;

use dashmap::DashMap;
use secrecy::SecretString;

use promptchain_core::provider::{ProviderHandle, ProviderSource};
use promptchain_types::provider::ProviderError;

use crate::llm::{OllamaProvider, OpenAiProvider};

/// Caching provider factory backed by process environment.
#[derive(Default)]
pub struct ProviderFactory {
    cache: DashMap<String, Arc<ProviderHandle>>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(&self, name: &str) -> Result<ProviderHandle, ProviderError> {
        match name {
            "openai" => {
                let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
                    ProviderError::Auth(
                        "OPENAI_API_KEY is not set; export it to use the openai provider"
                            .to_string(),
                    )
                })?;
                Ok(ProviderHandle::with_batch(OpenAiProvider::new(
                    SecretString::from(api_key),
                )))
            }
            "ollama" => {
                let provider = match std::env::var("OLLAMA_BASE_URL") {
                    Ok(base_url) => OllamaProvider::new(base_url),
                    Err(_) => OllamaProvider::local(),
                };
                Ok(ProviderHandle::completion_only(provider))
            }
            other => Err(ProviderError::InvalidRequest(format!(
                "unknown provider: '{other}' (expected 'openai' or 'ollama')"
            ))),
        }
    }
}

impl ProviderSource for ProviderFactory {
    fn get(&self, name: &str) -> Result<Arc<ProviderHandle>, ProviderError> {
        if let Some(handle) = self.cache.get(name) {
            return Ok(Arc::clone(&handle));
        }
        let handle = Arc::new(self.build(name)?);
        self.cache.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_invalid_request() {
        let factory = ProviderFactory::new();
        let err = factory.get("claude").unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn ollama_builds_without_credentials() {
        let factory = ProviderFactory::new();
        let handle = factory.get("ollama").unwrap();
        assert_eq!(handle.completion.name(), "ollama");
        assert!(!handle.supports_batch());
    }

    #[test]
    fn handles_are_cached() {
        let factory = ProviderFactory::new();
        let first = factory.get("ollama").unwrap();
        let second = factory.get("ollama").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
