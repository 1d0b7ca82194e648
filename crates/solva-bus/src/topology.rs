// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stream and consumer-group naming.
//!
//! One shared ingress stream carries every backend-to-agent message,
//! partitioned by the `target_agent` field; each worker pool filters with
//! its own consumer group.  Egress is isolated per session: every chat
//! session gets its own stream, which is what prevents cross-session
//! leakage under concurrency.  Streams are created lazily by the first
//! publish or the first group-create.

/// Backend → agents.  Shared by all worker pools.
pub const INGRESS_STREAM: &str = "solva:backend_to_agent";

/// Agents → backend, global fallback.  Used only for messages that carry
/// no session id; not required for correctness.
pub const GLOBAL_EGRESS_STREAM: &str = "solva:agent_to_backend";

/// Consumer group the orchestrator uses on session egress streams.
pub const ORCHESTRATOR_GROUP: &str = "orchestrator";

/// Fully isolated egress stream for one chat session.
pub fn session_egress_stream(session_id: &str) -> String {
    format!("solva:agent_to_backend_session_{session_id}")
}

/// Consumer group for one worker pool on the ingress stream.
pub fn agent_group(agent_name: &str) -> String {
    format!("{}_consumers", agent_name.to_lowercase())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
