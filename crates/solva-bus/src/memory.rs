// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory implementation of the [`Bus`] trait.
//!
//! Deterministic stand-in for Redis Streams with the same consumer-group
//! semantics: each entry is delivered to exactly one consumer per group
//! until acked, pending entries survive for re-reads, and stale entries
//! can be claimed by a peer consumer.  Used by orchestration tests so the
//! full pipeline runs without a broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::bus::{Bus, StreamEntry};
use crate::error::BusError;

#[derive(Default)]
struct GroupState {
    /// Index of the next entry not yet delivered to any consumer.
    cursor: usize,
    /// Delivered-but-unacked entries, by entry id.
    pending: HashMap<String, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    index: usize,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
pub struct MemoryBus {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all streams that currently exist (created by a publish or
    /// a group-create).
    pub fn stream_names(&self) -> Vec<String> {
        let streams = self.streams.lock().unwrap();
        let mut names: Vec<String> = streams.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total number of entries ever appended to a stream.
    pub fn len(&self, stream: &str) -> usize {
        let streams = self.streams.lock().unwrap();
        streams.get(stream).map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BusError::Command(format!("NOGROUP no such stream: {stream}")))?;
        // Split borrows: the cursor/pending update must not alias entries.
        let StreamState {
            entries, groups, ..
        } = &mut *state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| BusError::Command(format!("NOGROUP no such group: {group}")))?;

        let mut out = Vec::new();
        while out.len() < count && group_state.cursor < entries.len() {
            let index = group_state.cursor;
            let entry = entries[index].clone();
            group_state.pending.insert(
                entry.id.clone(),
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    index,
                },
            );
            group_state.cursor += 1;
            out.push(entry);
        }
        Ok(out)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, BusError> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields.clone(),
        });
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let deadline = Instant::now() + block;
        loop {
            let entries = self.take_new(stream, group, consumer, count)?;
            if !entries.is_empty() || Instant::now() >= deadline {
                return Ok(entries);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let streams = self.streams.lock().unwrap();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };
        let mut indices: Vec<usize> = group_state
            .pending
            .values()
            .filter(|p| p.consumer == consumer)
            .map(|p| p.index)
            .collect();
        indices.sort_unstable();
        Ok(indices
            .into_iter()
            .take(count)
            .map(|i| state.entries[i].clone())
            .collect())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut streams = self.streams.lock().unwrap();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut indices = Vec::new();
        for pending in group_state.pending.values_mut() {
            if indices.len() >= count {
                break;
            }
            if pending.consumer != consumer
                && now.duration_since(pending.delivered_at) >= min_idle
            {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                indices.push(pending.index);
            }
        }
        indices.sort_unstable();
        Ok(indices
            .into_iter()
            .map(|i| state.entries[i].clone())
            .collect())
    }

    async fn list_streams(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        let streams = self.streams.lock().unwrap();
        let mut names: Vec<String> = streams
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError> {
        let streams = self.streams.lock().unwrap();
        Ok(streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &str) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("type".to_string(), v.to_string());
        m
    }

    const BLOCK: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn append_assigns_monotonic_ids() {
        let bus = MemoryBus::new();
        let a = bus.append("s", &fields("a")).await.unwrap();
        let b = bus.append("s", &fields("b")).await.unwrap();
        assert!(a < b);
    }

    #[tokio::test]
    async fn read_without_group_is_an_error() {
        let bus = MemoryBus::new();
        bus.append("s", &fields("a")).await.unwrap();
        let err = bus.read_group("s", "g", "c", 1, BLOCK).await.unwrap_err();
        assert!(err.to_string().contains("NOGROUP"));
    }

    #[tokio::test]
    async fn entry_delivered_to_exactly_one_consumer_per_group() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", &fields("a")).await.unwrap();

        let first = bus.read_group("s", "g", "c1", 10, BLOCK).await.unwrap();
        let second = bus.read_group("s", "g", "c2", 10, BLOCK).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "second consumer must not see the entry");
    }

    #[tokio::test]
    async fn two_groups_each_see_every_entry() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g1").await.unwrap();
        bus.ensure_group("s", "g2").await.unwrap();
        bus.append("s", &fields("a")).await.unwrap();

        let g1 = bus.read_group("s", "g1", "c", 10, BLOCK).await.unwrap();
        let g2 = bus.read_group("s", "g2", "c", 10, BLOCK).await.unwrap();
        assert_eq!(g1.len(), 1);
        assert_eq!(g2.len(), 1);
    }

    #[tokio::test]
    async fn unacked_entries_come_back_via_read_pending() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", &fields("a")).await.unwrap();

        let delivered = bus.read_group("s", "g", "c", 10, BLOCK).await.unwrap();
        assert_eq!(delivered.len(), 1);

        // Not acked → still pending under the same consumer name.
        let pending = bus.read_pending("s", "g", "c", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, delivered[0].id);

        bus.ack("s", "g", &delivered[0].id).await.unwrap();
        let pending = bus.read_pending("s", "g", "c", 10).await.unwrap();
        assert!(pending.is_empty());
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_entries_claimable_by_peer_consumer() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", &fields("a")).await.unwrap();

        // c1 takes the entry and "crashes" (never acks).
        bus.read_group("s", "g", "c1", 10, BLOCK).await.unwrap();

        // Within the grace period nothing is claimable.
        let early = bus
            .claim_stale("s", "g", "c2", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        // With a zero grace period c2 takes it over.
        let claimed = bus
            .claim_stale("s", "g", "c2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        let pending = bus.read_pending("s", "g", "c2", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn list_streams_filters_by_prefix() {
        let bus = MemoryBus::new();
        bus.append("solva:agent_to_backend_session_a", &fields("x"))
            .await
            .unwrap();
        bus.append("solva:agent_to_backend_session_b", &fields("x"))
            .await
            .unwrap();
        bus.append("solva:backend_to_agent", &fields("x")).await.unwrap();

        let sessions = bus
            .list_streams("solva:agent_to_backend_session_")
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.contains("session_")));
    }

    #[tokio::test]
    async fn streams_are_isolated() {
        let bus = MemoryBus::new();
        bus.ensure_group("s1", "g").await.unwrap();
        bus.ensure_group("s2", "g").await.unwrap();
        bus.append("s1", &fields("a")).await.unwrap();

        let s2 = bus.read_group("s2", "g", "c", 10, BLOCK).await.unwrap();
        assert!(s2.is_empty());
        let s1 = bus.read_group("s1", "g", "c", 10, BLOCK).await.unwrap();
        assert_eq!(s1.len(), 1);
    }

    #[tokio::test]
    async fn fifo_order_within_a_stream() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        for i in 0..5 {
            bus.append("s", &fields(&format!("m{i}"))).await.unwrap();
        }
        let entries = bus.read_group("s", "g", "c", 10, BLOCK).await.unwrap();
        let types: Vec<&str> = entries.iter().map(|e| e.fields["type"].as_str()).collect();
        assert_eq!(types, vec!["m0", "m1", "m2", "m3", "m4"]);
    }
}
