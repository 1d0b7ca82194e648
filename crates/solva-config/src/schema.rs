// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub clarify: ClarifyConfig,
    /// Directory holding per-agent prompt configs
    /// (`<dir>/<role>/prompts/config.yaml`).  `None` uses the built-in
    /// prompts compiled into each agent.
    #[serde(default)]
    pub prompts_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" | "anthropic" | "google" | "custom" | "mock".
    /// "custom" speaks the OpenAI-compatible wire format against `base_url`.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Required for provider = "custom".
    pub base_url: Option<String>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Output-token budget for agent-mode answers
    #[serde(default = "default_answer_max_tokens")]
    pub answer_max_tokens: u32,
    /// Output-token budget for free-pass replies
    #[serde(default = "default_freepass_max_tokens")]
    pub freepass_max_tokens: u32,
}

fn default_answer_max_tokens() -> u32 {
    2000
}
fn default_freepass_max_tokens() -> u32 {
    4000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            // api_key_env stays None so the driver falls through to the
            // provider's canonical env var (OPENAI_API_KEY, …).
            api_key_env: None,
            api_key: None,
            base_url: None,
            temperature: Some(0.2),
            answer_max_tokens: default_answer_max_tokens(),
            freepass_max_tokens: default_freepass_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Redis endpoint for the stream bus
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Block timeout for consumer-group reads, in milliseconds
    #[serde(default = "default_stream_block_ms")]
    pub stream_block_ms: u64,
    /// Approximate MAXLEN cap applied to every stream on publish.
    /// 0 disables trimming.
    #[serde(default = "default_stream_trim_maxlen")]
    pub stream_trim_maxlen: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_stream_block_ms() -> u64 {
    1000
}
fn default_stream_trim_maxlen() -> u64 {
    10_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            stream_block_ms: default_stream_block_ms(),
            stream_trim_maxlen: default_stream_trim_maxlen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Postgres connection URL for the session store.  `None` disables
    /// persistence in worker processes (turns still complete; nothing is
    /// written).  The orchestrator requires it.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Upper bound on the connection pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind address for the orchestrator edge
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Wall-clock bound on one chat turn, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8080".into()
}
fn default_request_timeout() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarifyConfig {
    /// Upper bound on clarification turns per request; exceeding it forces
    /// finalization regardless of remaining missing fields.
    #[serde(default = "default_max_clarify_turns")]
    pub max_turns: u32,
}

fn default_max_clarify_turns() -> u32 {
    3
}

impl Default for ClarifyConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_clarify_turns(),
        }
    }
}

impl Config {
    /// Apply the documented environment-variable overrides on top of the
    /// file-based layers.  Deployment environments set these per container;
    /// they always win over YAML.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LLM_PROVIDER") {
            if !v.is_empty() {
                self.model.provider = v;
                if let Some(name) = default_model_for(&self.model.provider) {
                    self.model.name = name;
                }
            }
        }
        if let Some(env) = model_name_env_for(&self.model.provider) {
            if let Ok(v) = std::env::var(env) {
                if !v.is_empty() {
                    self.model.name = v;
                }
            }
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            if !v.is_empty() {
                self.bus.redis_url = v;
            }
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            if !v.is_empty() {
                self.store.database_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("MAX_CLARIFY_TURNS") {
            if let Ok(n) = v.parse() {
                self.clarify.max_turns = n;
            }
        }
        if let Ok(v) = std::env::var("ANSWER_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                self.model.answer_max_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("FREEPASS_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                self.model.freepass_max_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse() {
                self.server.request_timeout_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("STREAM_BLOCK_MS") {
            if let Ok(n) = v.parse() {
                self.bus.stream_block_ms = n;
            }
        }
        if let Ok(v) = std::env::var("STREAM_TRIM_MAXLEN") {
            if let Ok(n) = v.parse() {
                self.bus.stream_trim_maxlen = n;
            }
        }
    }
}

/// Canonical model-name env var for each provider, mirroring how the
/// deployment configures one model per provider.
fn model_name_env_for(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("OPENAI_CHAT_MODEL"),
        "anthropic" => Some("ANTHROPIC_CHAT_MODEL"),
        "google" => Some("GOOGLE_CHAT_MODEL"),
        "custom" => Some("CUSTOM_CHAT_MODEL"),
        _ => None,
    }
}

/// Sensible default model when only the provider is switched via env.
fn default_model_for(provider: &str) -> Option<String> {
    match provider {
        "openai" => Some("gpt-4o".into()),
        "anthropic" => Some("claude-sonnet-4-5".into()),
        "google" => Some("gemini-2.0-flash".into()),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
