// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Provider failure surfaced by the LLM gateway.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing API key: set {0}")]
    MissingApiKey(String),

    #[error("{provider} error {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("prompt template error: {0}")]
    Template(String),
}

impl LlmError {
    /// Transient failures are retried with backoff; everything else is
    /// terminal and surfaces to the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Network(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_transient() {
        assert!(LlmError::Network("reset".into()).is_transient());
    }

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        let rl = LlmError::Api {
            provider: "openai".into(),
            status: 429,
            message: "slow down".into(),
        };
        let srv = LlmError::Api {
            provider: "openai".into(),
            status: 503,
            message: "overloaded".into(),
        };
        assert!(rl.is_transient());
        assert!(srv.is_transient());
    }

    #[test]
    fn client_errors_are_terminal() {
        let bad = LlmError::Api {
            provider: "openai".into(),
            status: 400,
            message: "bad request".into(),
        };
        assert!(!bad.is_transient());
        assert!(!LlmError::MissingApiKey("OPENAI_API_KEY".into()).is_transient());
        assert!(!LlmError::Template("missing {x}".into()).is_transient());
    }
}
