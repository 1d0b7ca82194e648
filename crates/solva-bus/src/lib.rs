// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The solva agent bus.
//!
//! A durable ordered log with named streams, per-stream consumer groups,
//! explicit acknowledgement, and pending-entry recovery — the only
//! coordination medium between the HTTP orchestrator and the agent
//! worker pool.
//!
//! # Topology
//!
//! ```text
//! orchestrator ──publish──▶ solva:backend_to_agent ──group per pool──▶ workers
//!       ▲                                                                │
//!       └── solva:agent_to_backend_session_<id> ◀──────publish───────────┘
//! ```
//!
//! Every worker pool filters the shared ingress stream by `target_agent`
//! and acks off-topic entries immediately.  Each chat session owns an
//! isolated egress stream; the orchestrator's consumer group on that
//! stream is what guarantees a client only ever sees its own session's
//! events.

mod bus;
mod error;
mod memory;
mod messages;
mod redis;
pub mod topology;
pub mod wire;

pub use bus::{Bus, BusExt, StreamEntry};
pub use error::{BusError, CodecError};
pub use memory::MemoryBus;
pub use messages::{
    ClassificationRecord, Egress, Envelope, HistoryMessage, Ingress, Quality,
};
pub use self::redis::RedisBus;
