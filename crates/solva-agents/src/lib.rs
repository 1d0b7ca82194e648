// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The five solva worker agents and their process supervisor.
//!
//! Control flow for one agent-mode turn:
//!
//! ```text
//! orchestrator ──classify_question──▶ Classifier
//!     ▲                                  │ answerable? needs_clarify?
//!     │ classification_result            ▼
//!     │                     ┌── Improvement (bounded clarify loop)
//!     │ clarification_* ◀───┘      │
//!     │                            ▼ ready_for_answer
//!     │ answer_chunk × N ◀── Answer Generator
//!     │ streaming_complete         │ generate_summary (off-path)
//!     │                            ▼
//!     │ summary_result ◀───── Observer
//! ```
//!
//! Free-pass mode bypasses everything but the Free-talker.  All state an
//! agent needs for a turn travels in the `request_id`; only the clarify
//! sub-protocol holds in-process state, bounded by `max_clarify_turns`.

mod classifier;
mod freetalker;
mod generator;
mod improvement;
mod observer;
pub mod prompt;
mod runner;
pub mod supervisor;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use solva_bus::{Bus, RedisBus};
use solva_config::{Config, PromptLibrary};
use solva_model::{Gateway, ProviderConfig};
use solva_store::Store;

pub use classifier::{record_from_value, ClassifierAgent};
pub use freetalker::FreeTalkerAgent;
pub use generator::GeneratorAgent;
pub use improvement::ImprovementAgent;
pub use observer::ObserverAgent;
pub use runner::{Agent, Subscriber};

/// Wire identities used in `target_agent` routing.
pub mod names {
    pub const CLASSIFIER: &str = "QuestionClassifierAgent";
    pub const IMPROVEMENT: &str = "QuestionImprovementAgent";
    pub const GENERATOR: &str = "AnswerGeneratorAgent";
    pub const FREETALKER: &str = "FreeTalkerAgent";
    pub const OBSERVER: &str = "ObserverAgent";
}

/// Build the agent for a CLI role name.
pub fn agent_for_role(
    role: &str,
    bus: Arc<dyn Bus>,
    gateway: Gateway,
    store: Option<Store>,
    config: &Config,
    prompts: Option<&PromptLibrary>,
) -> anyhow::Result<Arc<dyn Agent>> {
    let role_prompts = prompts.and_then(|p| p.get(role));
    let agent: Arc<dyn Agent> = match role {
        "classifier" => Arc::new(ClassifierAgent::new(bus, gateway, store, role_prompts)),
        "improvement" => Arc::new(ImprovementAgent::new(
            bus,
            gateway,
            store,
            config.clarify.max_turns,
            role_prompts,
        )),
        "generator" => Arc::new(GeneratorAgent::new(
            bus,
            gateway,
            config.model.answer_max_tokens,
            role_prompts,
        )),
        "freetalker" => Arc::new(FreeTalkerAgent::new(
            bus,
            gateway,
            config.model.freepass_max_tokens,
            role_prompts,
        )),
        "observer" => Arc::new(ObserverAgent::new(bus, gateway, store, role_prompts)),
        other => anyhow::bail!("unknown agent role: {other}"),
    };
    Ok(agent)
}

/// Run one agent role as a long-lived worker process: connect the bus,
/// the model provider, and (when configured) the session store, then
/// subscribe forever.
pub async fn run_worker_role(role: &str, config: &Config) -> anyhow::Result<()> {
    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect(&config.bus.redis_url, config.bus.stream_trim_maxlen)
            .await
            .context("connecting to the bus")?,
    );

    let provider = solva_model::from_config(&ProviderConfig {
        provider: config.model.provider.clone(),
        name: config.model.name.clone(),
        api_key_env: config.model.api_key_env.clone(),
        api_key: config.model.api_key.clone(),
        base_url: config.model.base_url.clone(),
        temperature: config.model.temperature,
    })
    .context("constructing the model provider")?;
    let gateway = Gateway::new(provider);

    let store = match &config.store.database_url {
        Some(url) => match Store::connect(url, config.store.max_connections).await {
            Ok(store) => Some(store),
            Err(e) => {
                // Persistence is never fatal to a turn; run without it.
                warn!("session store unavailable, continuing without persistence: {e}");
                None
            }
        },
        None => None,
    };

    let prompts = config
        .prompts_dir
        .as_deref()
        .map(|dir| PromptLibrary::load(Path::new(dir)));

    let agent = agent_for_role(role, bus.clone(), gateway, store, config, prompts.as_ref())?;
    info!(
        role,
        agent = agent.name(),
        provider = %config.model.provider,
        "agent worker ready"
    );

    let block = Duration::from_millis(config.bus.stream_block_ms);
    Subscriber::new(bus, agent, block).run().await
}
