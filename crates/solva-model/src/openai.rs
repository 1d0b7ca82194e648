// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion driver.
//!
//! Serves two configured providers: `openai` itself and `custom`, which
//! points the same `/chat/completions` wire format at a user-supplied
//! proxy `base_url` (no auth header when no key is configured).

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::provider::ResponseStream;
use crate::{CompletionRequest, LlmError, Message, ResponseEvent, Role};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — standard for hosted providers.
    Bearer,
    /// No authentication header — local or network-internal proxies.
    None,
}

pub struct OpenAiCompatProvider {
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    key_hint: String,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    auth_style: AuthStyle,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        key_hint: impl Into<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            key_hint: key_hint.into(),
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            auth_style,
            client: reqwest::Client::new(),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, LlmError> {
        match self.auth_style {
            AuthStyle::Bearer => {
                let key = self
                    .api_key
                    .as_deref()
                    .ok_or_else(|| LlmError::MissingApiKey(self.key_hint.clone()))?;
                Ok(req.bearer_auth(key))
            }
            AuthStyle::None => Ok(req),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, LlmError> {
        let messages = build_messages(&req.messages);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": self.temperature,
        });
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            stream = req.stream,
            message_count = req.messages.len(),
            "sending completion request"
        );

        let http_req = self.authed(self.client.post(&self.chat_url).json(&body))?;
        let resp = http_req
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                provider: self.driver_name.to_string(),
                status,
                message,
            });
        }

        if !req.stream {
            let v: Value = resp
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
            return Ok(oneshot_into_stream(&v));
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, LlmError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(LlmError::Network(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Turn a non-streaming completion body into the same event sequence a
/// streamed call would produce.
fn oneshot_into_stream(v: &Value) -> ResponseStream {
    let content = v["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string();
    let mut events = vec![Ok(ResponseEvent::TextDelta(content))];
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        events.push(Ok(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }
    events.push(Ok(ResponseEvent::Done));
    Box::pin(futures::stream::iter(events))
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<Result<ResponseEvent, LlmError>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<Result<ResponseEvent, LlmError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };
    }

    if let Some(text) = v["choices"][0]["delta"]["content"].as_str() {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn build_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({ "role": role_str(&m.role), "content": m.content }))
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
