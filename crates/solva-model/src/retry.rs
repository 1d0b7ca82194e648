// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Capped exponential backoff with jitter for transient provider errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::LlmError;

/// Retry `op` up to `attempts` times, sleeping between tries with
/// exponential backoff plus up to 50% random jitter.  Only errors for
/// which [`LlmError::is_transient`] holds are retried.
pub async fn with_backoff<T, F, Fut>(
    attempts: u32,
    base: Duration,
    op: F,
) -> Result<T, LlmError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff_delay(base, attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "transient LLM error, retrying: {e}");
                tokio::time::sleep(delay).await;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable: the loop always returns on the final attempt.
    Err(last.unwrap_or_else(|| LlmError::Network("retry loop exhausted".into())))
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1 << (attempt - 1).min(6));
    let jitter_cap = (exp.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_cap);
    exp + Duration::from_millis(jitter)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
