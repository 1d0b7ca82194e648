// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BusError;
use crate::messages::{Egress, Envelope, Ingress};
use crate::topology::{session_egress_stream, GLOBAL_EGRESS_STREAM, INGRESS_STREAM};
use crate::wire;

/// One entry read from a stream: the server-assigned id plus the raw
/// string field map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

/// Durable ordered log with named streams, consumer groups, explicit
/// acknowledgement, and pending-entry recovery.
///
/// Delivery is at-least-once: every entry is handed to exactly one
/// consumer of a group until acked, and unacked entries older than a
/// grace period can be claimed by any peer consumer.  Consumers must be
/// idempotent by `request_id` + `type`.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Append an entry; creates the stream when missing.  Returns the
    /// server-assigned monotonic id.
    async fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, BusError>;

    /// Create the consumer group (and the stream) if missing.  A group
    /// that already exists is success.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    /// Read new entries for this consumer, blocking up to `block`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BusError>;

    /// Re-read entries already delivered to this consumer but not acked
    /// (crash recovery after restart under the same consumer name).
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError>;

    /// Claim entries pending on *other* consumers of the group that have
    /// been idle longer than `min_idle` (peer crash recovery).
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError>;

    /// Acknowledge one entry for the group.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError>;

    /// Names of existing streams starting with `prefix` (e.g. every live
    /// session egress stream).
    async fn list_streams(&self, prefix: &str) -> Result<Vec<String>, BusError>;

    /// Number of delivered-but-unacked entries for the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), BusError>;
}

/// Typed publish helpers layered over the raw [`Bus`] operations.
#[async_trait]
pub trait BusExt: Bus {
    /// Publish a backend → agent message on the shared ingress stream.
    async fn publish_ingress(
        &self,
        envelope: &Envelope,
        payload: &Ingress,
    ) -> Result<String, BusError> {
        let fields = wire::encode(envelope, payload)?;
        self.append(INGRESS_STREAM, &fields).await
    }

    /// Publish an agent → orchestrator message.  Messages with a session
    /// id ride that session's isolated stream; the rest fall back to the
    /// global egress stream.
    async fn publish_egress(
        &self,
        envelope: &Envelope,
        payload: &Egress,
    ) -> Result<String, BusError> {
        let fields = wire::encode(envelope, payload)?;
        let stream = match &envelope.session_id {
            Some(sid) if !sid.is_empty() => session_egress_stream(sid),
            _ => GLOBAL_EGRESS_STREAM.to_string(),
        };
        self.append(&stream, &fields).await
    }
}

impl<T: Bus + ?Sized> BusExt for T {}
