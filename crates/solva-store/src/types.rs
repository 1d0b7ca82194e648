// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse session status visible in the session store.
///
/// Transitions are one-way within a turn:
/// `new → classifying → (clarifying →)* answering → answered → summarized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    New,
    Classifying,
    Clarifying,
    Answering,
    Answered,
    Summarized,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Classifying => "classifying",
            Stage::Clarifying => "clarifying",
            Stage::Answering => "answering",
            Stage::Answered => "answered",
            Stage::Summarized => "summarized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Stage::New),
            "classifying" => Some(Stage::Classifying),
            "clarifying" => Some(Stage::Clarifying),
            "answering" => Some(Stage::Answering),
            "answered" => Some(Stage::Answered),
            "summarized" => Some(Stage::Summarized),
            _ => None,
        }
    }

    /// Position in the per-turn progression; a stage may only move to a
    /// higher rank, except `clarifying` which may repeat.
    pub fn rank(&self) -> u8 {
        match self {
            Stage::New => 0,
            Stage::Classifying => 1,
            Stage::Clarifying => 2,
            Stage::Answering => 3,
            Stage::Answered => 4,
            Stage::Summarized => 5,
        }
    }

    /// Whether moving from `self` to `next` respects the one-way order.
    /// Repeated `clarifying` turns are legal.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        next.rank() > self.rank() || (next == Stage::Clarifying && *self == Stage::Clarifying)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who wrote a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Maice,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Maice => "maice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Sender::User),
            "maice" => Some(Sender::Maice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: String,
    pub title: Option<String>,
    pub is_active: bool,
    pub stage: Stage,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: Uuid,
    pub sender: Sender,
    pub content: String,
    pub message_type: String,
    pub parent_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClarifyTurnRecord {
    pub request_id: Uuid,
    pub turn_number: i32,
    pub focus: String,
    pub question: String,
    pub student_response: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub session_id: Uuid,
    pub conversation_summary: String,
    pub student_status: serde_json::Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
