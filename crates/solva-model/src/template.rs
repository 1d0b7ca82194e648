// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt templates.
//!
//! A template is a `{system_prompt, user_template}` pair whose user part
//! carries `{variable}` placeholders.  Templates come from per-agent YAML
//! configuration at init time; rendering validates that every placeholder
//! has a value before substitution, so a missing variable fails the call
//! instead of leaking a literal `{question}` to the model.

use std::collections::HashMap;

use regex::Regex;

use crate::LlmError;

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system_prompt: String,
    pub user_template: String,
}

/// A fully rendered prompt pair ready for a completion request.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

impl PromptTemplate {
    pub fn new(system_prompt: impl Into<String>, user_template: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_template: user_template.into(),
        }
    }

    /// Placeholder names referenced by the user template.
    pub fn placeholders(&self) -> Vec<String> {
        // Compiled per call; templates render a handful of times per turn.
        let re = Regex::new(r"\{([a-z][a-z0-9_]*)\}").unwrap();
        let mut names: Vec<String> = re
            .captures_iter(&self.user_template)
            .map(|c| c[1].to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Substitute every placeholder.  All placeholders must be present in
    /// `vars`; extra variables are ignored.
    pub fn render(&self, vars: &HashMap<&str, String>) -> Result<RenderedPrompt, LlmError> {
        let mut user = self.user_template.clone();
        for name in self.placeholders() {
            let value = vars.get(name.as_str()).ok_or_else(|| {
                LlmError::Template(format!("missing template variable: {name}"))
            })?;
            user = user.replace(&format!("{{{name}}}"), value);
        }
        Ok(RenderedPrompt {
            system: self.system_prompt.clone(),
            user,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let t = PromptTemplate::new("sys", "Q: {question}\nC: {context}");
        let r = t
            .render(&vars(&[("question", "2x=4?"), ("context", "none")]))
            .unwrap();
        assert_eq!(r.user, "Q: 2x=4?\nC: none");
        assert_eq!(r.system, "sys");
    }

    #[test]
    fn render_fails_on_missing_variable() {
        let t = PromptTemplate::new("sys", "Q: {question}");
        let err = t.render(&vars(&[])).unwrap_err();
        assert!(matches!(err, LlmError::Template(m) if m.contains("question")));
    }

    #[test]
    fn render_ignores_extra_variables() {
        let t = PromptTemplate::new("sys", "plain");
        let r = t.render(&vars(&[("unused", "x")])).unwrap();
        assert_eq!(r.user, "plain");
    }

    #[test]
    fn placeholders_are_deduplicated_and_sorted() {
        let t = PromptTemplate::new("s", "{b} {a} {b}");
        assert_eq!(t.placeholders(), vec!["a", "b"]);
    }

    #[test]
    fn repeated_placeholder_substituted_everywhere() {
        let t = PromptTemplate::new("s", "{x} and {x}");
        let r = t.render(&vars(&[("x", "y")])).unwrap();
        assert_eq!(r.user, "y and y");
    }

    #[test]
    fn values_containing_braces_do_not_break_rendering() {
        let t = PromptTemplate::new("s", "expr: {latex}");
        let r = t.render(&vars(&[("latex", r"\frac{1}{2}")])).unwrap();
        assert_eq!(r.user, r"expr: \frac{1}{2}");
    }
}
