// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Closed tagged unions for everything that rides the bus.
//!
//! Ingress carries backend-to-agent traffic on the shared stream; egress
//! carries agent-to-orchestrator traffic on per-session streams.  The
//! `type` tag is the wire discriminator; consumers drop unknown types
//! with a log instead of forwarding them.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::wire::de;

/// Common fields carried next to every payload.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub target_agent: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    /// ISO-8601 UTC
    pub timestamp: String,
    /// Set by agents on egress
    pub agent_name: Option<String>,
}

impl Envelope {
    fn stamped() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Envelope for a backend → agent message.
    pub fn to_agent(
        target_agent: impl Into<String>,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            target_agent: Some(target_agent.into()),
            session_id: Some(session_id.into()),
            request_id: Some(request_id.into()),
            timestamp: Self::stamped(),
            agent_name: None,
        }
    }

    /// Envelope for an agent → orchestrator message.
    pub fn from_agent(
        agent_name: impl Into<String>,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            target_agent: None,
            session_id: Some(session_id.into()),
            request_id: Some(request_id.into()),
            timestamp: Self::stamped(),
            agent_name: Some(agent_name.into()),
        }
    }

    pub(crate) fn from_object(object: &Map<String, Value>) -> Self {
        let get = |key: &str| {
            object
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        Self {
            target_agent: get("target_agent"),
            session_id: get("session_id"),
            request_id: get("request_id"),
            timestamp: get("timestamp").unwrap_or_default(),
            agent_name: get("agent_name"),
        }
    }
}

/// Answerability verdict produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Answerable,
    NeedsClarify,
    Unanswerable,
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::Answerable => write!(f, "answerable"),
            Quality::NeedsClarify => write!(f, "needs_clarify"),
            Quality::Unanswerable => write!(f, "unanswerable"),
        }
    }
}

/// One classification record, immutable once produced.
///
/// The defaults are the contract for unparseable or partial model output:
/// `K1`, `answerable`, empty collections, and the literal fallback
/// reasoning string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRecord {
    #[serde(default = "default_knowledge_code")]
    pub knowledge_code: String,
    #[serde(default = "default_quality")]
    pub quality: Quality,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default)]
    pub unit_tags: Vec<String>,
    #[serde(default = "default_reasoning")]
    pub reasoning: String,
}

fn default_knowledge_code() -> String {
    "K1".into()
}
fn default_quality() -> Quality {
    Quality::Answerable
}
fn default_reasoning() -> String {
    "분류 근거 없음".into()
}

impl Default for ClassificationRecord {
    fn default() -> Self {
        Self {
            knowledge_code: default_knowledge_code(),
            quality: default_quality(),
            missing_fields: Vec::new(),
            unit_tags: Vec::new(),
            reasoning: default_reasoning(),
        }
    }
}

/// One turn of prior conversation, as the client sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Backend → agent messages on the shared ingress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Ingress {
    ClassifyQuestion {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "de::opt_bool_lenient"
        )]
        is_new_question: Option<bool>,
    },
    ProcessClarification {
        clarification: Value,
        #[serde(deserialize_with = "de::u32_lenient")]
        turn_number: u32,
    },
    UserClarificationResponse {
        clarification_answer: String,
        #[serde(deserialize_with = "de::u32_lenient")]
        question_index: u32,
        #[serde(deserialize_with = "de::u32_lenient")]
        total_questions: u32,
    },
    NeedsClarify {
        missing_fields: Vec<String>,
        question: String,
    },
    ReadyForAnswer {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        classification_result: ClassificationRecord,
    },
    GenerateAnswer {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        classification_result: ClassificationRecord,
    },
    FreepassRequest {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_history: Option<Vec<HistoryMessage>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    GenerateSummary {
        conversation_text: String,
    },
}

impl Ingress {
    pub fn type_name(&self) -> &'static str {
        match self {
            Ingress::ClassifyQuestion { .. } => "classify_question",
            Ingress::ProcessClarification { .. } => "process_clarification",
            Ingress::UserClarificationResponse { .. } => "user_clarification_response",
            Ingress::NeedsClarify { .. } => "needs_clarify",
            Ingress::ReadyForAnswer { .. } => "ready_for_answer",
            Ingress::GenerateAnswer { .. } => "generate_answer",
            Ingress::FreepassRequest { .. } => "freepass_request",
            Ingress::GenerateSummary { .. } => "generate_summary",
        }
    }
}

/// Agent → orchestrator messages on per-session egress streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Egress {
    ClassificationResult {
        classification_result: ClassificationRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        question: Option<String>,
    },
    ClassificationFailed {
        error: String,
    },
    ClarificationQuestion {
        question: String,
        #[serde(deserialize_with = "de::u32_lenient")]
        question_index: u32,
        #[serde(deserialize_with = "de::u32_lenient")]
        total_questions: u32,
        missing_fields: Vec<String>,
    },
    ClarificationComplete {
        improved_question: String,
        user_responses: Vec<String>,
    },
    ClarificationError {
        error: String,
    },
    AnswerChunk {
        content: String,
        #[serde(deserialize_with = "de::u32_lenient")]
        chunk_index: u32,
    },
    AnswerResult {
        answer: String,
        knowledge_code: String,
        answerability: Quality,
    },
    AnswerError {
        error: String,
        #[serde(default)]
        full_response: String,
    },
    StreamingComplete {
        full_response: String,
        #[serde(deserialize_with = "de::u32_lenient")]
        total_chunks: u32,
        #[serde(deserialize_with = "de::f64_lenient")]
        processing_time_seconds: f64,
    },
    FreepassChunk {
        content: String,
        #[serde(deserialize_with = "de::u32_lenient")]
        chunk_index: u32,
    },
    FreepassError {
        error: String,
        message: String,
    },
    SummaryResult {
        summary: String,
    },
    ProcessingLog {
        agent_name: String,
        stage: String,
        message: String,
    },
}

impl Egress {
    pub fn type_name(&self) -> &'static str {
        match self {
            Egress::ClassificationResult { .. } => "classification_result",
            Egress::ClassificationFailed { .. } => "classification_failed",
            Egress::ClarificationQuestion { .. } => "clarification_question",
            Egress::ClarificationComplete { .. } => "clarification_complete",
            Egress::ClarificationError { .. } => "clarification_error",
            Egress::AnswerChunk { .. } => "answer_chunk",
            Egress::AnswerResult { .. } => "answer_result",
            Egress::AnswerError { .. } => "answer_error",
            Egress::StreamingComplete { .. } => "streaming_complete",
            Egress::FreepassChunk { .. } => "freepass_chunk",
            Egress::FreepassError { .. } => "freepass_error",
            Egress::SummaryResult { .. } => "summary_result",
            Egress::ProcessingLog { .. } => "processing_log",
        }
    }

    /// Whether this event ends the SSE relay for the current turn.
    ///
    /// `clarification_question` closes the stream too: the student's
    /// reply arrives over a fresh HTTP request, so the turn is suspended
    /// rather than finished, but the relay has nothing more to wait for.
    pub fn is_turn_terminal(&self) -> bool {
        match self {
            Egress::StreamingComplete { .. }
            | Egress::ClassificationFailed { .. }
            | Egress::ClarificationError { .. }
            | Egress::ClarificationQuestion { .. }
            | Egress::AnswerError { .. }
            | Egress::FreepassError { .. } => true,
            Egress::ClassificationResult {
                classification_result,
                ..
            } => classification_result.quality == Quality::Unanswerable,
            _ => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
