// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Uniform LLM gateway for the solva agents.
//!
//! Every worker calls an external model provider through the same
//! [`ModelProvider`] trait; provider selection is configuration-driven
//! (`openai`, `anthropic`, `google`, a `custom` OpenAI-compatible proxy,
//! and a deterministic `mock` for tests).  [`Gateway`] layers the two
//! call modes on top: *oneshot* drains a non-streaming call into the
//! full content plus usage, *stream* yields content deltas as the
//! provider sends them.  Transient failures retry with capped
//! exponential backoff and jitter.

mod anthropic;
mod error;
mod google;
mod mock;
mod openai;
mod provider;
mod retry;
mod template;
mod types;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

pub use anthropic::AnthropicProvider;
pub use error::LlmError;
pub use google::GoogleProvider;
pub use mock::{MockProvider, ScriptedProvider};
pub use openai::{AuthStyle, OpenAiCompatProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use template::{PromptTemplate, RenderedPrompt};
pub use types::{CompletionRequest, Message, ResponseEvent, Role, Usage};

/// Minimal provider configuration the gateway needs; mirrors the
/// `model:` section of the service config without depending on it.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: String,
    pub name: String,
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
}

/// Resolve the API key: explicit value first, then the configured env
/// var, then the provider's canonical env var.
fn resolve_api_key(cfg: &ProviderConfig, default_env: &str) -> (Option<String>, String) {
    if let Some(key) = &cfg.api_key {
        return (Some(key.clone()), default_env.to_string());
    }
    let env = cfg
        .api_key_env
        .clone()
        .unwrap_or_else(|| default_env.to_string());
    (std::env::var(&env).ok().filter(|k| !k.is_empty()), env)
}

/// Construct a provider from configuration.
pub fn from_config(cfg: &ProviderConfig) -> Result<Arc<dyn ModelProvider>, LlmError> {
    match cfg.provider.as_str() {
        "openai" => {
            let (key, hint) = resolve_api_key(cfg, "OPENAI_API_KEY");
            Ok(Arc::new(OpenAiCompatProvider::new(
                "openai",
                cfg.name.clone(),
                key,
                hint,
                cfg.base_url.as_deref().unwrap_or("https://api.openai.com/v1"),
                None,
                cfg.temperature,
                AuthStyle::Bearer,
            )))
        }
        "custom" => {
            let base_url = cfg.base_url.as_deref().ok_or_else(|| {
                LlmError::InvalidResponse("provider \"custom\" requires base_url".into())
            })?;
            let (key, hint) = resolve_api_key(cfg, "CUSTOM_API_KEY");
            let auth = if key.is_some() {
                AuthStyle::Bearer
            } else {
                AuthStyle::None
            };
            Ok(Arc::new(OpenAiCompatProvider::new(
                "custom",
                cfg.name.clone(),
                key,
                hint,
                base_url,
                None,
                cfg.temperature,
                auth,
            )))
        }
        "anthropic" => {
            let (key, _) = resolve_api_key(cfg, "ANTHROPIC_API_KEY");
            Ok(Arc::new(AnthropicProvider::new(
                cfg.name.clone(),
                key,
                cfg.base_url.clone(),
                None,
                cfg.temperature,
            )))
        }
        "google" => {
            let (key, _) = resolve_api_key(cfg, "GEMINI_API_KEY");
            Ok(Arc::new(GoogleProvider::new(
                cfg.name.clone(),
                key,
                cfg.base_url.clone(),
                None,
                cfg.temperature,
            )))
        }
        "mock" => Ok(Arc::new(MockProvider)),
        other => Err(LlmError::InvalidResponse(format!(
            "unknown LLM provider: {other}"
        ))),
    }
}

/// Full content plus usage from a oneshot call.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// The two call modes every agent uses, with retry on transient errors.
#[derive(Clone)]
pub struct Gateway {
    provider: Arc<dyn ModelProvider>,
    attempts: u32,
    backoff: Duration,
}

impl Gateway {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }

    /// Override the retry policy (tests use a single attempt).
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts;
        self.backoff = backoff;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Non-streaming call: returns the full content and usage.
    pub async fn oneshot(&self, req: CompletionRequest) -> Result<Completion, LlmError> {
        let mut req = req;
        req.stream = false;
        retry::with_backoff(self.attempts, self.backoff, |_| {
            let req = req.clone();
            async move {
                let mut stream = self.provider.complete(req).await?;
                let mut completion = Completion::default();
                while let Some(event) = stream.next().await {
                    match event? {
                        ResponseEvent::TextDelta(t) => completion.content.push_str(&t),
                        ResponseEvent::Usage {
                            input_tokens,
                            output_tokens,
                        } => {
                            completion.usage.input_tokens += input_tokens;
                            completion.usage.output_tokens += output_tokens;
                        }
                        ResponseEvent::Done => break,
                        ResponseEvent::Error(message) => {
                            return Err(LlmError::InvalidResponse(message))
                        }
                    }
                }
                Ok(completion)
            }
        })
        .await
    }

    /// Streaming call: retries only the stream *open*; once deltas flow,
    /// mid-stream failures surface to the consumer (which reports a
    /// partial result rather than silently re-asking the model).
    pub async fn stream(&self, req: CompletionRequest) -> Result<ResponseStream, LlmError> {
        let mut req = req;
        req.stream = true;
        retry::with_backoff(self.attempts, self.backoff, |_| {
            let req = req.clone();
            async move { self.provider.complete(req).await }
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
