// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared ingress subscriber loop.
//!
//! Every worker process runs one [`Subscriber`]: it owns the consumer
//! group for its pool on the shared ingress stream, drains its own
//! pending entries at startup (crash recovery under the same consumer
//! name), periodically claims stale entries left behind by crashed
//! peers, and acks every entry exactly once — including off-topic and
//! malformed ones.  Handler failures emit typed egress events inside the
//! agent and never kill the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use solva_bus::topology::{agent_group, INGRESS_STREAM};
use solva_bus::{Bus, Envelope, Ingress, StreamEntry};

/// Idle time before a peer's pending entry is considered abandoned.
const CLAIM_MIN_IDLE: Duration = Duration::from_secs(60);
/// Claim attempt cadence, in poll iterations.
const CLAIM_EVERY: u64 = 32;

#[async_trait]
pub trait Agent: Send + Sync {
    /// Wire identity used in `target_agent` routing.
    fn name(&self) -> &'static str;

    /// Whether a `target_agent` value addresses this worker.  The
    /// default accepts the exact name; agents with a legacy short alias
    /// override this.
    fn accepts(&self, target: &str) -> bool {
        target == self.name()
    }

    /// Process one addressed ingress message.  Errors are logged by the
    /// subscriber; the agent is responsible for emitting its typed
    /// failure event before returning one.
    async fn handle(&self, envelope: Envelope, payload: Ingress) -> anyhow::Result<()>;
}

pub struct Subscriber {
    bus: Arc<dyn Bus>,
    agent: Arc<dyn Agent>,
    group: String,
    consumer: String,
    block: Duration,
    polls: AtomicU64,
}

impl Subscriber {
    pub fn new(bus: Arc<dyn Bus>, agent: Arc<dyn Agent>, block: Duration) -> Self {
        let group = agent_group(agent.name());
        let consumer = format!("{}_{}", agent.name(), Uuid::new_v4().simple());
        Self {
            bus,
            agent,
            group,
            consumer,
            block,
            polls: AtomicU64::new(0),
        }
    }

    /// Create the consumer group and work through entries this consumer
    /// was delivered before a restart.
    pub async fn init(&self) -> anyhow::Result<()> {
        self.bus.ensure_group(INGRESS_STREAM, &self.group).await?;
        let pending = self
            .bus
            .read_pending(INGRESS_STREAM, &self.group, &self.consumer, 64)
            .await?;
        if !pending.is_empty() {
            info!(
                agent = self.agent.name(),
                count = pending.len(),
                "recovering pending entries"
            );
            for entry in pending {
                self.process(entry).await;
            }
        }
        Ok(())
    }

    /// One read cycle.  Returns the number of entries processed.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let polls = self.polls.fetch_add(1, Ordering::Relaxed);
        let mut entries = self
            .bus
            .read_group(INGRESS_STREAM, &self.group, &self.consumer, 8, self.block)
            .await?;

        if polls % CLAIM_EVERY == CLAIM_EVERY - 1 {
            let claimed = self
                .bus
                .claim_stale(INGRESS_STREAM, &self.group, &self.consumer, CLAIM_MIN_IDLE, 16)
                .await?;
            if !claimed.is_empty() {
                warn!(
                    agent = self.agent.name(),
                    count = claimed.len(),
                    "claimed stale entries from crashed peer"
                );
                entries.extend(claimed);
            }
        }

        let count = entries.len();
        for entry in entries {
            self.process(entry).await;
        }
        Ok(count)
    }

    /// Subscribe forever.  Bus errors back off and retry; they do not
    /// crash the worker.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.init().await?;
        info!(
            agent = self.agent.name(),
            group = %self.group,
            "ingress subscription started"
        );
        loop {
            if let Err(e) = self.poll_once().await {
                error!(agent = self.agent.name(), "ingress poll failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    async fn process(&self, entry: StreamEntry) {
        let decoded = match solva_bus::wire::decode::<Ingress>(&entry.fields) {
            Ok(d) => d,
            Err(e) => {
                // Unknown type or malformed payload: drop with a log.
                warn!(
                    agent = self.agent.name(),
                    id = %entry.id,
                    "dropping undecodable ingress entry: {e}"
                );
                self.ack(&entry.id).await;
                return;
            }
        };

        let target = decoded.envelope.target_agent.as_deref().unwrap_or("");
        if !self.agent.accepts(target) {
            debug!(agent = self.agent.name(), target, "off-topic entry acked");
            self.ack(&entry.id).await;
            return;
        }

        debug!(
            agent = self.agent.name(),
            id = %entry.id,
            kind = decoded.payload.type_name(),
            request_id = decoded.envelope.request_id.as_deref().unwrap_or("-"),
            "handling ingress message"
        );
        if let Err(e) = self
            .agent
            .handle(decoded.envelope, decoded.payload)
            .await
        {
            error!(agent = self.agent.name(), id = %entry.id, "handler failed: {e}");
        }
        // At-least-once discipline: the entry is acked whether or not the
        // handler succeeded — failures were surfaced as typed egress
        // events, not by leaving the entry pending.
        self.ack(&entry.id).await;
    }

    async fn ack(&self, id: &str) {
        if let Err(e) = self.bus.ack(INGRESS_STREAM, &self.group, id).await {
            warn!(agent = self.agent.name(), id, "ack failed: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use solva_bus::{BusExt, MemoryBus};
    use std::sync::Mutex;

    struct RecordingAgent {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Agent for RecordingAgent {
        fn name(&self) -> &'static str {
            "QuestionClassifierAgent"
        }
        async fn handle(&self, _envelope: Envelope, payload: Ingress) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(payload.type_name().to_string());
            Ok(())
        }
    }

    fn classify(target: &str) -> (Envelope, Ingress) {
        (
            Envelope::to_agent(target, "s-1", "r-1"),
            Ingress::ClassifyQuestion {
                question: "q".into(),
                context: None,
                is_new_question: None,
            },
        )
    }

    #[tokio::test]
    async fn addressed_entry_is_handled_and_acked() {
        let bus = Arc::new(MemoryBus::new());
        let agent = Arc::new(RecordingAgent {
            seen: Mutex::new(vec![]),
        });
        let sub = Subscriber::new(bus.clone(), agent.clone(), Duration::from_millis(10));
        sub.init().await.unwrap();

        let (env, payload) = classify("QuestionClassifierAgent");
        bus.publish_ingress(&env, &payload).await.unwrap();

        let n = sub.poll_once().await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(agent.seen.lock().unwrap().as_slice(), ["classify_question"]);
        assert_eq!(
            bus.pending_count(INGRESS_STREAM, &agent_group("QuestionClassifierAgent"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn off_topic_entry_is_acked_without_handling() {
        let bus = Arc::new(MemoryBus::new());
        let agent = Arc::new(RecordingAgent {
            seen: Mutex::new(vec![]),
        });
        let sub = Subscriber::new(bus.clone(), agent.clone(), Duration::from_millis(10));
        sub.init().await.unwrap();

        let (env, payload) = classify("AnswerGeneratorAgent");
        bus.publish_ingress(&env, &payload).await.unwrap();

        sub.poll_once().await.unwrap();
        assert!(agent.seen.lock().unwrap().is_empty());
        assert_eq!(
            bus.pending_count(INGRESS_STREAM, &agent_group("QuestionClassifierAgent"))
                .await
                .unwrap(),
            0,
            "off-topic entries must still be acked"
        );
    }

    #[tokio::test]
    async fn malformed_entry_is_dropped_with_ack() {
        let bus = Arc::new(MemoryBus::new());
        let agent = Arc::new(RecordingAgent {
            seen: Mutex::new(vec![]),
        });
        let sub = Subscriber::new(bus.clone(), agent.clone(), Duration::from_millis(10));
        sub.init().await.unwrap();

        let mut fields = std::collections::BTreeMap::new();
        fields.insert("type".to_string(), "mystery_event".to_string());
        fields.insert("target_agent".to_string(), "QuestionClassifierAgent".to_string());
        bus.append(INGRESS_STREAM, &fields).await.unwrap();

        sub.poll_once().await.unwrap();
        assert!(agent.seen.lock().unwrap().is_empty());
        assert_eq!(
            bus.pending_count(INGRESS_STREAM, &agent_group("QuestionClassifierAgent"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn init_recovers_own_pending_entries() {
        let bus = Arc::new(MemoryBus::new());
        let agent = Arc::new(RecordingAgent {
            seen: Mutex::new(vec![]),
        });
        let sub = Subscriber::new(bus.clone(), agent.clone(), Duration::from_millis(10));
        sub.init().await.unwrap();

        let (env, payload) = classify("QuestionClassifierAgent");
        bus.publish_ingress(&env, &payload).await.unwrap();

        // Simulate a crash mid-delivery: take the entry without acking.
        let group = agent_group("QuestionClassifierAgent");
        let taken = bus
            .read_group(INGRESS_STREAM, &group, &sub.consumer, 8, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        // A fresh init under the same consumer name replays it.
        sub.init().await.unwrap();
        assert_eq!(agent.seen.lock().unwrap().as_slice(), ["classify_question"]);
    }
}
