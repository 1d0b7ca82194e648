// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::types::{MessageRecord, Sender, SessionRecord, Stage};
use crate::{Store, StoreError};

fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<SessionRecord, StoreError> {
    let stage_str: String = row.try_get("stage")?;
    Ok(SessionRecord {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        is_active: row.try_get("is_active")?,
        stage: Stage::parse(&stage_str).unwrap_or(Stage::New),
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<MessageRecord, StoreError> {
    let sender_str: String = row.try_get("sender")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        sender: Sender::parse(&sender_str).unwrap_or(Sender::User),
        content: row.try_get("content")?,
        message_type: row.try_get("message_type")?,
        parent_message_id: row.try_get("parent_message_id")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Create a new active session in stage `new`.
    pub async fn create_session(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRecord, StoreError> {
        let session_id = Uuid::new_v4();
        let now: DateTime<Utc> = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (session_id, user_id, title, is_active, stage, updated_at)
             VALUES ($1, $2, $3, TRUE, 'new', $4)",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(title)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(SessionRecord {
            session_id,
            user_id: user_id.to_string(),
            title: title.map(|t| t.to_string()),
            is_active: true,
            stage: Stage::New,
            updated_at: now,
        })
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<SessionRecord, StoreError> {
        let row = sqlx::query(
            "SELECT session_id, user_id, title, is_active, stage, updated_at
             FROM sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::SessionNotFound(session_id))?;
        session_from_row(&row)
    }

    /// All active sessions for a user, newest first.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id, user_id, title, is_active, stage, updated_at
             FROM sessions WHERE user_id = $1 AND is_active
             ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// Advance the session stage, honouring the one-way order.
    /// A regression (e.g. a duplicate terminal after `answered`) is a
    /// no-op, not an error.
    pub async fn advance_stage(
        &self,
        session_id: Uuid,
        next: Stage,
    ) -> Result<Stage, StoreError> {
        let current = self.get_session(session_id).await?.stage;
        if !current.can_advance_to(next) {
            return Ok(current);
        }
        sqlx::query("UPDATE sessions SET stage = $2, updated_at = now() WHERE session_id = $1")
            .bind(session_id)
            .bind(next.as_str())
            .execute(self.pool())
            .await?;
        Ok(next)
    }

    pub async fn set_title(&self, session_id: Uuid, title: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET title = $2, updated_at = now() WHERE session_id = $1")
            .bind(session_id)
            .bind(title)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Terminate a session.  Returns false when the session does not
    /// exist or belongs to a different user.
    pub async fn deactivate_session(
        &self,
        session_id: Uuid,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = FALSE, updated_at = now()
             WHERE session_id = $1 AND user_id = $2",
        )
        .bind(session_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append one transcript message.  The transcript is append-only;
    /// messages are never mutated.
    pub async fn append_message(
        &self,
        session_id: Uuid,
        sender: Sender,
        content: &str,
        message_type: &str,
        parent_message_id: Option<i64>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO session_messages
                 (session_id, sender, content, message_type, parent_message_id)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(session_id)
        .bind(sender.as_str())
        .bind(content)
        .bind(message_type)
        .bind(parent_message_id)
        .fetch_one(self.pool())
        .await?;
        let id: i64 = row.try_get("id")?;
        Ok(id)
    }

    /// Full transcript for a session, oldest first.
    pub async fn session_history(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, sender, content, message_type, parent_message_id, created_at
             FROM session_messages WHERE session_id = $1 ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }
}
