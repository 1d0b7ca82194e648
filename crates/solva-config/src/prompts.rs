// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-agent prompt configuration registry.
//!
//! Each agent role may ship a `prompts/config.yaml` under the configured
//! prompts directory:
//!
//! ```text
//! agents/
//!   classifier/prompts/config.yaml
//!   freetalker/prompts/config.yaml
//!   ...
//! ```
//!
//! The file carries a `system_prompt` plus named `user_prompts` templates.
//! The registry is read once at worker startup and shared read-only; agents
//! fall back to their built-in prompts for any role or template that is
//! absent.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

/// Prompt configuration for one agent role.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentPrompts {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub user_prompts: HashMap<String, String>,
}

impl AgentPrompts {
    /// Named user-prompt template for this role, if configured.
    pub fn user_prompt(&self, name: &str) -> Option<&str> {
        self.user_prompts.get(name).map(|s| s.as_str())
    }
}

/// Read-only registry of per-agent prompt configurations.
#[derive(Debug, Default)]
pub struct PromptLibrary {
    configs: HashMap<String, AgentPrompts>,
}

impl PromptLibrary {
    /// Scan `<dir>/<role>/prompts/config.yaml` for every role directory.
    /// Unparseable files are skipped with a warning so one bad template
    /// cannot keep a worker from starting.
    pub fn load(dir: &Path) -> Self {
        let mut configs = HashMap::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %dir.display(), "prompt directory not readable: {e}");
                return Self::default();
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(role) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if role.starts_with('_') {
                continue;
            }
            let config_file = path.join("prompts/config.yaml");
            if !config_file.is_file() {
                continue;
            }
            match std::fs::read_to_string(&config_file)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    serde_yaml::from_str::<AgentPrompts>(&text).map_err(|e| e.to_string())
                }) {
                Ok(prompts) => {
                    debug!(role, "loaded prompt config");
                    configs.insert(role.to_string(), prompts);
                }
                Err(e) => warn!(role, "skipping bad prompt config: {e}"),
            }
        }

        Self { configs }
    }

    pub fn get(&self, role: &str) -> Option<&AgentPrompts> {
        self.configs.get(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(|s| s.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_role_config(dir: &Path, role: &str, yaml: &str) {
        let prompts = dir.join(role).join("prompts");
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::write(prompts.join("config.yaml"), yaml).unwrap();
    }

    #[test]
    fn load_reads_system_prompt_and_user_prompts() {
        let tmp = tempfile::tempdir().unwrap();
        write_role_config(
            tmp.path(),
            "classifier",
            "system_prompt: |\n  You classify questions.\nuser_prompts:\n  classify: \"Q: {question}\"\n",
        );
        let lib = PromptLibrary::load(tmp.path());
        let p = lib.get("classifier").expect("role must be loaded");
        assert!(p.system_prompt.as_deref().unwrap().contains("classify"));
        assert_eq!(p.user_prompt("classify"), Some("Q: {question}"));
    }

    #[test]
    fn load_skips_roles_without_config() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("empty_role")).unwrap();
        let lib = PromptLibrary::load(tmp.path());
        assert!(lib.get("empty_role").is_none());
    }

    #[test]
    fn load_skips_underscore_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_role_config(tmp.path(), "_shared", "system_prompt: nope\n");
        let lib = PromptLibrary::load(tmp.path());
        assert!(lib.get("_shared").is_none());
    }

    #[test]
    fn load_survives_bad_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        write_role_config(tmp.path(), "broken", ":: not yaml ::\n\t!!");
        write_role_config(tmp.path(), "good", "system_prompt: ok\n");
        let lib = PromptLibrary::load(tmp.path());
        assert!(lib.get("broken").is_none());
        assert!(lib.get("good").is_some());
    }

    #[test]
    fn load_missing_directory_returns_empty() {
        let lib = PromptLibrary::load(Path::new("/nonexistent/solva/prompts"));
        assert_eq!(lib.roles().count(), 0);
    }
}
