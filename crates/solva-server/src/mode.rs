// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sticky balanced A/B mode assignment.
//!
//! A user's first contact assigns `agent` or `freepass`: whichever mode
//! currently has fewer users, with a uniform coin flip on a tie.  The
//! assignment is persisted and immutable afterwards; repeated calls
//! always return the stored value.

use solva_store::{Store, StoreError};
use tracing::info;

pub const MODE_AGENT: &str = "agent";
pub const MODE_FREEPASS: &str = "freepass";

/// Balanced choice given the current populations.
pub fn pick_mode(agent_count: i64, freepass_count: i64, coin: bool) -> &'static str {
    if agent_count < freepass_count {
        MODE_AGENT
    } else if freepass_count < agent_count {
        MODE_FREEPASS
    } else if coin {
        MODE_AGENT
    } else {
        MODE_FREEPASS
    }
}

#[derive(Clone)]
pub struct ModeAssigner {
    store: Store,
}

impl ModeAssigner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persisted mode if set, otherwise assign one now.  Concurrent
    /// first contact is resolved by the store's guarded upsert; whatever
    /// value wins is what everyone sees.
    pub async fn get_or_assign(&self, user_id: &str) -> Result<String, StoreError> {
        if let Some(mode) = self.store.user_mode(user_id).await? {
            return Ok(mode);
        }
        let counts = self.store.mode_counts().await?;
        let mode = pick_mode(counts.agent, counts.freepass, rand::random());
        let assigned = self.store.assign_mode_if_absent(user_id, mode).await?;
        info!(user_id, mode = %assigned, "mode assigned");
        Ok(assigned)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minority_mode_wins() {
        assert_eq!(pick_mode(3, 5, true), MODE_AGENT);
        assert_eq!(pick_mode(3, 5, false), MODE_AGENT);
        assert_eq!(pick_mode(7, 2, true), MODE_FREEPASS);
        assert_eq!(pick_mode(7, 2, false), MODE_FREEPASS);
    }

    #[test]
    fn tie_follows_the_coin() {
        assert_eq!(pick_mode(4, 4, true), MODE_AGENT);
        assert_eq!(pick_mode(4, 4, false), MODE_FREEPASS);
        assert_eq!(pick_mode(0, 0, true), MODE_AGENT);
    }
}
