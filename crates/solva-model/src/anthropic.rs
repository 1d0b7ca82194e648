// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::provider::ResponseStream;
use crate::{CompletionRequest, LlmError, Message, ResponseEvent, Role};

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, LlmError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::MissingApiKey("ANTHROPIC_API_KEY".into()))?;

        let (system_text, messages) = build_anthropic_messages(&req.messages);

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": self.temperature,
            "stream": req.stream,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }

        debug!(model = %self.model, stream = req.stream, "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                provider: "anthropic".into(),
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
        // SSE lines can be split across TCP chunks, so we carry a remainder
        // buffer forward.  Only complete lines (terminated by '\n') are
        // parsed; anything left over is prepended to the next chunk.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return std::future::ready(Some(vec![Err(LlmError::Network(
                            e.to_string(),
                        ))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            events.push(Ok(parse_anthropic_event(&v)));
                        }
                    }
                }
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

fn oneshot_into_stream(v: &Value) -> ResponseStream {
    let content = v["content"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let mut events = vec![Ok(ResponseEvent::TextDelta(content))];
    if let Some(usage) = v.get("usage") {
        events.push(Ok(ResponseEvent::Usage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }
    events.push(Ok(ResponseEvent::Done));
    Box::pin(futures::stream::iter(events))
}

pub(crate) fn parse_anthropic_event(v: &Value) -> ResponseEvent {
    match v["type"].as_str().unwrap_or("") {
        "content_block_delta" => {
            let delta = &v["delta"];
            if delta["type"].as_str() == Some("text_delta") {
                ResponseEvent::TextDelta(delta["text"].as_str().unwrap_or("").to_string())
            } else {
                ResponseEvent::TextDelta(String::new())
            }
        }
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                return ResponseEvent::Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                };
            }
            ResponseEvent::TextDelta(String::new())
        }
        "message_delta" => {
            if let Some(usage) = v.get("usage") {
                return ResponseEvent::Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                };
            }
            ResponseEvent::TextDelta(String::new())
        }
        "message_stop" => ResponseEvent::Done,
        "error" => ResponseEvent::Error(
            v["error"]["message"].as_str().unwrap_or("unknown").to_string(),
        ),
        _ => ResponseEvent::TextDelta(String::new()),
    }
}

/// Convert messages into the Anthropic wire format.
///
/// Returns `(system_text, conversation_messages)`.  The system message is
/// separated out because Anthropic expects it as a top-level `system`
/// field, not as a conversation turn.
pub(crate) fn build_anthropic_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out = Vec::new();
    for m in messages {
        match m.role {
            Role::System => system_text = m.content.clone(),
            Role::User => out.push(json!({ "role": "user", "content": m.content })),
            Role::Assistant => out.push(json!({ "role": "assistant", "content": m.content })),
        }
    }
    (system_text, out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
