// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sticky per-user mode assignment.
//!
//! A user's mode (`agent` or `freepass`) is set on first contact and
//! immutable afterwards.  The write path is an upsert guarded by
//! `assigned_mode IS NULL`, so a concurrent first contact converges on a
//! single persisted value and readers after the race see one answer.

use chrono::Utc;
use sqlx::Row;

use crate::{Store, StoreError};

/// Current population per mode, used to keep the A/B split balanced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeCounts {
    pub agent: i64,
    pub freepass: i64,
}

impl Store {
    /// The persisted mode for a user, if one was ever assigned.
    pub async fn user_mode(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT assigned_mode FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|r| r.try_get::<Option<String>, _>("assigned_mode").ok().flatten()))
    }

    pub async fn mode_counts(&self) -> Result<ModeCounts, StoreError> {
        let row = sqlx::query(
            "SELECT
                 count(*) FILTER (WHERE assigned_mode = 'agent')    AS agent,
                 count(*) FILTER (WHERE assigned_mode = 'freepass') AS freepass
             FROM users",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(ModeCounts {
            agent: row.try_get("agent")?,
            freepass: row.try_get("freepass")?,
        })
    }

    /// Persist a mode for the user unless one already exists, then return
    /// whatever value actually won.  Tolerates concurrent first contact.
    pub async fn assign_mode_if_absent(
        &self,
        user_id: &str,
        mode: &str,
    ) -> Result<String, StoreError> {
        sqlx::query(
            "INSERT INTO users (user_id, assigned_mode, mode_assigned_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id) DO UPDATE
                 SET assigned_mode = EXCLUDED.assigned_mode,
                     mode_assigned_at = EXCLUDED.mode_assigned_at
                 WHERE users.assigned_mode IS NULL",
        )
        .bind(user_id)
        .bind(mode)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        // Read back: under a race the other writer may have won.
        let row = sqlx::query("SELECT assigned_mode FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(self.pool())
            .await?;
        let assigned: Option<String> = row.try_get("assigned_mode")?;
        Ok(assigned.unwrap_or_else(|| mode.to_string()))
    }
}
