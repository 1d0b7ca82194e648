// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration for the solva tutoring service.
//!
//! Configuration is merged from layered YAML files (system, home,
//! workspace-local, explicit `--config`) with environment variables
//! applied last for the operational knobs that deployments set per
//! container (`REDIS_URL`, `DATABASE_URL`, `LLM_PROVIDER`, …).
//!
//! Per-agent prompt templates are a separate, read-only registry loaded
//! once at worker startup from `agents/<role>/prompts/config.yaml`
//! files; they are not hot-reloaded per request.

mod loader;
mod prompts;
mod schema;

pub use loader::load;
pub use prompts::{AgentPrompts, PromptLibrary};
pub use schema::{
    BusConfig, ClarifyConfig, Config, ModelConfig, ServerConfig, StoreConfig,
};
