// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Redis Streams implementation of the [`Bus`] trait.
//!
//! One multiplexed connection manager is shared per process; the manager
//! reconnects on connection loss, and group reads simply resume from `>`
//! afterwards — unacked entries stay in the pending list and come back
//! through [`Bus::read_pending`] / [`Bus::claim_stale`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
// `::`-prefixed paths: this module shadows the crate name.
use ::redis::aio::ConnectionManager;
use ::redis::streams::{
    StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamPendingReply,
    StreamReadOptions, StreamReadReply,
};
use ::redis::{AsyncCommands, RedisError};
use tracing::{debug, warn};

use crate::bus::{Bus, StreamEntry};
use crate::error::BusError;

/// Publish retry cap.  Appends are the only operation retried here;
/// blocking reads surface errors to the caller's own poll loop.
const APPEND_ATTEMPTS: u32 = 3;
const APPEND_BACKOFF: Duration = Duration::from_millis(100);

pub struct RedisBus {
    conn: ConnectionManager,
    /// Approximate MAXLEN applied on every append; 0 disables trimming.
    trim_maxlen: u64,
}

impl RedisBus {
    pub async fn connect(url: &str, trim_maxlen: u64) -> Result<Self, BusError> {
        let client =
            ::redis::Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        debug!(url, "redis bus connected");
        Ok(Self { conn, trim_maxlen })
    }
}

fn cmd_err(e: RedisError) -> BusError {
    BusError::Command(e.to_string())
}

fn entries_from_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
    let mut entries = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let mut fields = BTreeMap::new();
            for (k, v) in id.map {
                match ::redis::from_redis_value::<String>(&v) {
                    Ok(s) => {
                        fields.insert(k, s);
                    }
                    Err(e) => warn!(field = %k, "dropping non-string stream value: {e}"),
                }
            }
            entries.push(StreamEntry { id: id.id, fields });
        }
    }
    entries
}

#[async_trait]
impl Bus for RedisBus {
    async fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, BusError> {
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let mut last = String::new();
        for attempt in 1..=APPEND_ATTEMPTS {
            let mut conn = self.conn.clone();
            let result: Result<String, RedisError> = if self.trim_maxlen > 0 {
                conn.xadd_maxlen(
                    stream,
                    StreamMaxlen::Approx(self.trim_maxlen as usize),
                    "*",
                    &items,
                )
                .await
            } else {
                conn.xadd(stream, "*", &items).await
            };
            match result {
                Ok(id) => return Ok(id),
                Err(e) => {
                    last = e.to_string();
                    warn!(stream, attempt, "bus append failed: {last}");
                    if attempt < APPEND_ATTEMPTS {
                        tokio::time::sleep(APPEND_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(BusError::Unavailable {
            attempts: APPEND_ATTEMPTS,
            last,
        })
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let result: Result<String, RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(_) => Ok(()),
            // Group already exists — first-create semantics are idempotent.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(cmd_err(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(cmd_err)?;
        Ok(entries_from_reply(reply))
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // Reading from "0" returns this consumer's own pending entries.
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &["0"], &opts)
            .await
            .map_err(cmd_err)?;
        Ok(entries_from_reply(reply))
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(cmd_err)?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.consumer != consumer && p.last_delivered_ms >= min_idle.as_millis() as usize)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                stream,
                group,
                consumer,
                min_idle.as_millis() as usize,
                &stale,
            )
            .await
            .map_err(cmd_err)?;

        let mut entries = Vec::new();
        for id in claimed.ids {
            let mut fields = BTreeMap::new();
            for (k, v) in id.map {
                if let Ok(s) = ::redis::from_redis_value::<String>(&v) {
                    fields.insert(k, s);
                }
            }
            entries.push(StreamEntry { id: id.id, fields });
        }
        Ok(entries)
    }

    async fn list_streams(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut names = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(cmd_err)?;
            names.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        names.sort();
        Ok(names)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await.map_err(cmd_err)?;
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply =
            conn.xpending(stream, group).await.map_err(cmd_err)?;
        Ok(reply.count() as u64)
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BusError::Connection(format!("unexpected ping reply: {pong}")))
        }
    }
}
