//! Provider router: builds every configured adapter and looks them up by name.
//!
//! Each adapter is wrapped in a [`RetryingProvider`] so that transient
//! failures are retried before a stream is handed to the agent loop.

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::retry::RetryingProvider;
use std::collections::BTreeMap;
use std::sync::Arc;
use toolweave_config::AppConfig;
use toolweave_core::provider::Provider;
use tracing::{debug, warn};

/// Named providers plus the one used when a request names none.
pub struct ProviderRouter {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: BTreeMap::new(),
            default_provider: default_provider.into(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        self.get(&self.default_provider)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

/// Build a router from `[providers.*]` and the default provider.
///
/// A provider's own key wins over the top-level `api_key`. Names without a
/// known endpoint need an `api_url`; those without one are skipped.
pub fn build_from_config(config: &AppConfig) -> ProviderRouter {
    let mut router = ProviderRouter::new(&config.default_provider);

    let mut wanted: Vec<(&str, Option<&str>, Option<&str>)> = config
        .providers
        .iter()
        .map(|(name, p)| (name.as_str(), p.api_key.as_deref(), p.api_url.as_deref()))
        .collect();
    if !config.providers.contains_key(&config.default_provider) {
        wanted.push((config.default_provider.as_str(), None, None));
    }

    for (name, own_key, api_url) in wanted {
        let api_key = own_key.or(config.api_key.as_deref()).unwrap_or_default();
        match adapter(name, api_key, api_url) {
            Some(inner) => {
                debug!(provider = %name, "Registered provider");
                let wrapped = RetryingProvider::from_config(inner, &config.provider_retry);
                router.register(name, Arc::new(wrapped));
            }
            None => warn!(provider = %name, "Unknown provider without api_url, skipping"),
        }
    }

    router
}

fn adapter(name: &str, api_key: &str, api_url: Option<&str>) -> Option<Arc<dyn Provider>> {
    if name == "anthropic" {
        let provider = match api_url {
            Some(url) => AnthropicProvider::new(api_key).with_base_url(url),
            None => AnthropicProvider::new(api_key),
        };
        return Some(Arc::new(provider));
    }
    let base_url = api_url.or_else(|| known_base_url(name))?;
    Some(Arc::new(OpenAiCompatProvider::new(name, base_url, api_key)))
}

/// Endpoints of OpenAI-compatible services that need no `api_url`.
fn known_base_url(provider_name: &str) -> Option<&'static str> {
    Some(match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "openai" => "https://api.openai.com/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "together" => "https://api.together.xyz/v1",
        "ollama" => "http://localhost:11434/v1",
        "vllm" => "http://localhost:8000/v1",
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1",
        _ => return None,
    })
}
