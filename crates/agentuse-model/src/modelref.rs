// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model reference parsing and driver metadata.
//!
//! Agent front-matter names its model as `provider:model-id`, e.g.
//! `openai:gpt-4o-mini` or `groq:llama-3.3-70b-versatile`.  The driver table
//! below is the single source of truth for which provider ids exist and
//! where their API key and base URL come from.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};

use crate::{ModelProvider, OpenAiCompatProvider, RetryProvider};

/// A parsed `provider:model-id` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.split_once(':') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider: provider.to_string(),
                model: model.to_string(),
            }),
            _ => bail!("invalid model reference {s:?}: expected `provider:model-id`"),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Metadata describing a registered model driver.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Provider id used in the `provider:model-id` reference.
    pub id: &'static str,
    /// Environment variable that holds the API key.  `None` for local
    /// servers that need no key.
    pub api_key_env: Option<&'static str>,
    /// Default base URL; overridable via `<PROVIDER>_BASE_URL`.
    pub base_url: &'static str,
}

/// Supported providers.  All speak the OpenAI-compatible chat-completions
/// protocol; gateways and local servers cover everything else.
pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "openai",
        api_key_env: Some("OPENAI_API_KEY"),
        base_url: "https://api.openai.com/v1",
    },
    DriverMeta {
        id: "openrouter",
        api_key_env: Some("OPENROUTER_API_KEY"),
        base_url: "https://openrouter.ai/api/v1",
    },
    DriverMeta {
        id: "groq",
        api_key_env: Some("GROQ_API_KEY"),
        base_url: "https://api.groq.com/openai/v1",
    },
    DriverMeta {
        id: "together",
        api_key_env: Some("TOGETHER_API_KEY"),
        base_url: "https://api.together.xyz/v1",
    },
    DriverMeta {
        id: "local",
        api_key_env: None,
        base_url: "http://127.0.0.1:8080/v1",
    },
];

/// Resolve a model reference into a ready-to-use provider.
///
/// The returned provider is wrapped in [`RetryProvider`], so transient
/// failures (429, 5xx, network) are retried up to 3 times with exponential
/// back-off before surfacing.  Credentials come from the supplied
/// environment snapshot — this function never reads the process environment.
pub fn resolve_provider(
    reference: &str,
    env: &HashMap<String, String>,
) -> anyhow::Result<Arc<dyn ModelProvider>> {
    let model_ref = ModelRef::parse(reference)?;
    let meta = DRIVERS
        .iter()
        .find(|d| d.id == model_ref.provider)
        .with_context(|| {
            let known: Vec<&str> = DRIVERS.iter().map(|d| d.id).collect();
            format!(
                "unknown model provider {:?} (known: {})",
                model_ref.provider,
                known.join(", ")
            )
        })?;

    let api_key = match meta.api_key_env {
        Some(var) => {
            let key = env.get(var).cloned().with_context(|| {
                format!("provider {:?} requires {var} to be set", meta.id)
            })?;
            Some(key)
        }
        None => None,
    };

    let base_url_var = format!("{}_BASE_URL", model_ref.provider.to_uppercase());
    let base_url = env
        .get(&base_url_var)
        .cloned()
        .unwrap_or_else(|| meta.base_url.to_string());

    let inner = OpenAiCompatProvider::new(meta.id, &model_ref.model, &base_url, api_key);
    Ok(Arc::new(RetryProvider::new(Arc::new(inner))))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_reference() {
        let r = ModelRef::parse("openai:gpt-4o-mini").unwrap();
        assert_eq!(r.provider, "openai");
        assert_eq!(r.model, "gpt-4o-mini");
    }

    #[test]
    fn model_id_may_contain_colons() {
        // Only the first colon separates provider from model.
        let r = ModelRef::parse("openrouter:anthropic/claude-sonnet-4.5:beta").unwrap();
        assert_eq!(r.provider, "openrouter");
        assert_eq!(r.model, "anthropic/claude-sonnet-4.5:beta");
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert!(ModelRef::parse("gpt-4o-mini").is_err());
        assert!(ModelRef::parse(":model").is_err());
        assert!(ModelRef::parse("provider:").is_err());
    }

    #[test]
    fn resolve_unknown_provider_names_known_ones() {
        let err = resolve_provider("frobnicator:x", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn resolve_without_api_key_fails_with_var_name() {
        let err = resolve_provider("openai:gpt-4o-mini", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn resolve_local_needs_no_key() {
        let provider = resolve_provider("local:qwen2.5-coder", &HashMap::new()).unwrap();
        assert_eq!(provider.model_name(), "qwen2.5-coder");
    }

    #[test]
    fn base_url_env_override_is_honoured() {
        let mut env = HashMap::new();
        env.insert("LOCAL_BASE_URL".to_string(), "http://10.0.0.2:9090/v1".to_string());
        // Resolution succeeds; the override is exercised inside the driver.
        assert!(resolve_provider("local:m", &env).is_ok());
    }
}
