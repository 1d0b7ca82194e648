// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session store façade.
//!
//! Process-wide registry of chat sessions, transcripts, classification
//! records, clarification turns, summaries, and sticky user modes —
//! backed by Postgres and accessed only through this repository layer.
//! Every write is its own short transaction on a bounded pool; nothing
//! here holds a lock across an await on the bus or an LLM call.

mod agent_data;
mod error;
mod sessions;
mod types;
mod users;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;

pub use agent_data::ClassificationRow;
pub use error::StoreError;
pub use types::{
    ClarifyTurnRecord, MessageRecord, Sender, SessionRecord, Stage, SummaryRecord,
};
pub use users::ModeCounts;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect with a bounded pool and create any missing tables.
    ///
    /// Schema creation is idempotent; migration tooling proper is a
    /// collaborator concern and intentionally absent here.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        debug!("session store connected");
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Liveness probe used by the health endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        const SCHEMA: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                assigned_mode TEXT,
                mode_assigned_at TIMESTAMPTZ,
                quota_used BIGINT NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                stage TEXT NOT NULL DEFAULT 'new',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS session_messages (
                id BIGSERIAL PRIMARY KEY,
                session_id UUID NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                message_type TEXT NOT NULL,
                parent_message_id BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE INDEX IF NOT EXISTS session_messages_session_idx
                ON session_messages (session_id, id)",
            "CREATE TABLE IF NOT EXISTS agent_question_classifications (
                request_id UUID PRIMARY KEY,
                session_id UUID NOT NULL,
                knowledge_code TEXT NOT NULL,
                quality TEXT NOT NULL,
                missing_fields JSONB NOT NULL DEFAULT '[]',
                unit_tags JSONB NOT NULL DEFAULT '[]',
                reasoning TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS agent_clarification_turns (
                request_id UUID NOT NULL,
                turn_number INT NOT NULL,
                focus TEXT NOT NULL,
                question TEXT NOT NULL,
                student_response TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (request_id, turn_number)
            )",
            "CREATE TABLE IF NOT EXISTS session_summaries (
                session_id UUID PRIMARY KEY,
                conversation_summary TEXT NOT NULL,
                student_status JSONB NOT NULL DEFAULT '{}',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS session_titles (
                session_id UUID PRIMARY KEY,
                title TEXT NOT NULL
            )",
        ];
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}
