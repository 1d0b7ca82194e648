// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent-produced records: classifications, clarification turns,
//! conversation summaries, and session titles.

use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::types::{ClarifyTurnRecord, SummaryRecord};
use crate::{Store, StoreError};

/// Classification as persisted, decoupled from the wire shape.
#[derive(Debug, Clone)]
pub struct ClassificationRow {
    pub request_id: Uuid,
    pub session_id: Uuid,
    pub knowledge_code: String,
    pub quality: String,
    pub missing_fields: Vec<String>,
    pub unit_tags: Vec<String>,
    pub reasoning: String,
}

impl Store {
    /// Insert a classification record.  Records are immutable; a
    /// redelivered `classify_question` overwrites with identical content,
    /// which keeps the write idempotent by `request_id`.
    pub async fn save_classification(&self, row: &ClassificationRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agent_question_classifications
                 (request_id, session_id, knowledge_code, quality,
                  missing_fields, unit_tags, reasoning)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (request_id) DO UPDATE
                 SET knowledge_code = EXCLUDED.knowledge_code,
                     quality = EXCLUDED.quality,
                     missing_fields = EXCLUDED.missing_fields,
                     unit_tags = EXCLUDED.unit_tags,
                     reasoning = EXCLUDED.reasoning",
        )
        .bind(row.request_id)
        .bind(row.session_id)
        .bind(&row.knowledge_code)
        .bind(&row.quality)
        .bind(Json(&row.missing_fields))
        .bind(Json(&row.unit_tags))
        .bind(&row.reasoning)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn classification(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ClassificationRow>, StoreError> {
        let row = sqlx::query(
            "SELECT request_id, session_id, knowledge_code, quality,
                    missing_fields, unit_tags, reasoning
             FROM agent_question_classifications WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(self.pool())
        .await?;
        let Some(row) = row else { return Ok(None) };
        let missing: Json<Vec<String>> = row.try_get("missing_fields")?;
        let tags: Json<Vec<String>> = row.try_get("unit_tags")?;
        Ok(Some(ClassificationRow {
            request_id: row.try_get("request_id")?,
            session_id: row.try_get("session_id")?,
            knowledge_code: row.try_get("knowledge_code")?,
            quality: row.try_get("quality")?,
            missing_fields: missing.0,
            unit_tags: tags.0,
            reasoning: row.try_get("reasoning")?,
        }))
    }

    /// Append one clarification turn.  Re-persisting the same turn number
    /// (message redelivery) updates in place.
    pub async fn save_clarify_turn(&self, turn: &ClarifyTurnRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agent_clarification_turns
                 (request_id, turn_number, focus, question, student_response)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (request_id, turn_number) DO UPDATE
                 SET focus = EXCLUDED.focus,
                     question = EXCLUDED.question,
                     student_response = EXCLUDED.student_response",
        )
        .bind(turn.request_id)
        .bind(turn.turn_number)
        .bind(&turn.focus)
        .bind(&turn.question)
        .bind(&turn.student_response)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn clarify_turns(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ClarifyTurnRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT request_id, turn_number, focus, question, student_response
             FROM agent_clarification_turns
             WHERE request_id = $1 ORDER BY turn_number",
        )
        .bind(request_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ClarifyTurnRecord {
                    request_id: row.try_get("request_id")?,
                    turn_number: row.try_get("turn_number")?,
                    focus: row.try_get("focus")?,
                    question: row.try_get("question")?,
                    student_response: row.try_get("student_response")?,
                })
            })
            .collect()
    }

    /// Upsert the per-session summary; overwritten on every turn.
    pub async fn upsert_summary(&self, summary: &SummaryRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_summaries (session_id, conversation_summary, student_status, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (session_id) DO UPDATE
                 SET conversation_summary = EXCLUDED.conversation_summary,
                     student_status = EXCLUDED.student_status,
                     updated_at = now()",
        )
        .bind(summary.session_id)
        .bind(&summary.conversation_summary)
        .bind(Json(&summary.student_status))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn summary(&self, session_id: Uuid) -> Result<Option<SummaryRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT session_id, conversation_summary, student_status
             FROM session_summaries WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;
        let Some(row) = row else { return Ok(None) };
        let status: Json<serde_json::Value> = row.try_get("student_status")?;
        Ok(Some(SummaryRecord {
            session_id: row.try_get("session_id")?,
            conversation_summary: row.try_get("conversation_summary")?,
            student_status: status.0,
        }))
    }

    pub async fn upsert_title(&self, session_id: Uuid, title: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_titles (session_id, title)
             VALUES ($1, $2)
             ON CONFLICT (session_id) DO UPDATE SET title = EXCLUDED.title",
        )
        .bind(session_id)
        .bind(title)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn title(&self, session_id: Uuid) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT title FROM session_titles WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.try_get("title")).transpose()?)
    }
}
