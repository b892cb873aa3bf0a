//! Provider resolution and model aliases.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sy_domain::config::{ApiKeys, ModelProvider};
use sy_domain::error::{Error, Result};

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// Resolve a directive alias (`/m:sonnet`) to a provider + model id.
/// Unknown names pass through as a bare model id for the current provider.
pub fn resolve_model_alias(alias: &str) -> Option<(ModelProvider, &'static str)> {
    match alias.to_lowercase().as_str() {
        "opus" => Some((ModelProvider::Anthropic, "claude-opus-4-20250514")),
        "sonnet" => Some((ModelProvider::Anthropic, "claude-sonnet-4-20250514")),
        "haiku" => Some((ModelProvider::Anthropic, "claude-3-5-haiku-20241022")),
        "gpt" | "gpt-4o" => Some((ModelProvider::Openai, "gpt-4o")),
        "gpt-mini" => Some((ModelProvider::Openai, "gpt-4o-mini")),
        "gemini" => Some((ModelProvider::Google, "gemini-2.0-flash")),
        _ => None,
    }
}

/// Caches one adapter per provider; api-key changes invalidate the cache.
/// Installed adapters (embedding, tests) shadow the HTTP bindings.
pub struct ProviderRegistry {
    timeout_ms: u64,
    cache: Mutex<HashMap<String, Arc<dyn LlmProvider>>>,
    installed: Mutex<HashMap<ModelProvider, Arc<dyn LlmProvider>>>,
}

impl ProviderRegistry {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            cache: Mutex::new(HashMap::new()),
            installed: Mutex::new(HashMap::new()),
        }
    }

    /// Install an adapter for a provider slot, bypassing HTTP resolution.
    pub fn install(&self, provider: ModelProvider, adapter: Arc<dyn LlmProvider>) {
        self.installed.lock().insert(provider, adapter);
    }

    pub fn resolve(
        &self,
        provider: ModelProvider,
        keys: &ApiKeys,
    ) -> Result<Arc<dyn LlmProvider>> {
        if let Some(installed) = self.installed.lock().get(&provider) {
            return Ok(installed.clone());
        }
        let (name, key) = match provider {
            ModelProvider::Anthropic => ("anthropic", keys.anthropic.as_ref()),
            ModelProvider::Openai => ("openai", keys.openai.as_ref()),
            ModelProvider::Google => ("google", keys.google.as_ref()),
            ModelProvider::Openrouter => ("openrouter", keys.openrouter.as_ref()),
        };
        let Some(key) = key else {
            return Err(Error::Config(format!("no API key configured for {name}")));
        };

        let cache_key = format!("{name}:{:x}", fxhash(key));
        if let Some(cached) = self.cache.lock().get(&cache_key) {
            return Ok(cached.clone());
        }

        tracing::debug!(provider = name, "constructing LLM adapter");
        let adapter: Arc<dyn LlmProvider> = match provider {
            ModelProvider::Anthropic => {
                Arc::new(AnthropicProvider::new(key.clone(), self.timeout_ms)?)
            }
            ModelProvider::Openai => Arc::new(OpenAiCompatProvider::new(
                "openai",
                "https://api.openai.com/v1",
                key.clone(),
                self.timeout_ms,
            )?),
            ModelProvider::Openrouter => Arc::new(OpenAiCompatProvider::new(
                "openrouter",
                "https://openrouter.ai/api/v1",
                key.clone(),
                self.timeout_ms,
            )?),
            ModelProvider::Google => Arc::new(OpenAiCompatProvider::new(
                "google",
                "https://generativelanguage.googleapis.com/v1beta/openai",
                key.clone(),
                self.timeout_ms,
            )?),
        };

        self.cache.lock().insert(cache_key, adapter.clone());
        Ok(adapter)
    }
}

// Cheap non-cryptographic hash for cache keys only.
fn fxhash(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve() {
        assert_eq!(
            resolve_model_alias("sonnet"),
            Some((ModelProvider::Anthropic, "claude-sonnet-4-20250514"))
        );
        assert_eq!(resolve_model_alias("GPT"), Some((ModelProvider::Openai, "gpt-4o")));
        assert_eq!(resolve_model_alias("made-up"), None);
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let registry = ProviderRegistry::new(1000);
        let err = registry
            .resolve(ModelProvider::Anthropic, &ApiKeys::default())
            .unwrap_err();
        assert!(err.to_string().contains("anthropic"));
    }

    #[test]
    fn resolved_providers_are_cached() {
        let registry = ProviderRegistry::new(1000);
        let keys = ApiKeys {
            anthropic: Some("k1".into()),
            ..Default::default()
        };
        let a = registry.resolve(ModelProvider::Anthropic, &keys).unwrap();
        let b = registry.resolve(ModelProvider::Anthropic, &keys).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
