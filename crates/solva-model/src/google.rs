// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `generateContent` / `streamGenerateContent` endpoints.
//!
//! # Endpoint pattern
//! `POST https://generativelanguage.googleapis.com/v1beta/models/{model}:streamGenerateContent?alt=sse`

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::provider::ResponseStream;
use crate::{CompletionRequest, LlmError, Message, ResponseEvent, Role};

pub struct GoogleProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl GoogleProvider {
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
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            max_tokens: max_tokens.unwrap_or(8192),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, LlmError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::MissingApiKey("GEMINI_API_KEY".into()))?;

        // Separate system instruction from conversation.
        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        for m in &req.messages {
            match m.role {
                Role::System => system_parts.push(json!({ "text": m.content })),
                Role::User => {
                    contents.push(json!({ "role": "user", "parts": [{ "text": m.content }] }))
                }
                Role::Assistant => {
                    contents.push(json!({ "role": "model", "parts": [{ "text": m.content }] }))
                }
            }
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": req.max_tokens.unwrap_or(self.max_tokens),
                "temperature": self.temperature,
            }
        });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }

        let endpoint = if req.stream {
            "streamGenerateContent?alt=sse&key="
        } else {
            "generateContent?key="
        };
        let url = format!(
            "{}/v1beta/models/{}:{}{}",
            self.base_url.trim_end_matches('/'),
            self.model,
            endpoint,
            key
        );

        debug!(model = %self.model, stream = req.stream, "sending Google Gemini request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                provider: "google".into(),
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
                        let data = data.trim();
                        if data == "[DONE]" {
                            events.push(Ok(ResponseEvent::Done));
                        } else if let Ok(v) = serde_json::from_str::<Value>(data) {
                            events.push(Ok(parse_gemini_chunk(&v)));
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
    let content = v["candidates"][0]["content"]["parts"]
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
    if let Some(meta) = v.get("usageMetadata") {
        events.push(Ok(ResponseEvent::Usage {
            input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        }));
    }
    events.push(Ok(ResponseEvent::Done));
    Box::pin(futures::stream::iter(events))
}

fn parse_gemini_chunk(v: &Value) -> ResponseEvent {
    if let Some(meta) = v.get("usageMetadata") {
        return ResponseEvent::Usage {
            input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        };
    }

    let candidate = &v["candidates"][0];
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(text) = part["text"].as_str() {
                return ResponseEvent::TextDelta(text.to_string());
            }
        }
    }

    // finishReason present without parts → stream finished
    if candidate["finishReason"].as_str().is_some() {
        return ResponseEvent::Done;
    }

    ResponseEvent::TextDelta(String::new())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelProvider;

    #[test]
    fn provider_name() {
        let p = GoogleProvider::new("gemini-2.0-flash".into(), None, None, None, None);
        assert_eq!(p.name(), "google");
        assert_eq!(p.model_name(), "gemini-2.0-flash");
    }

    #[test]
    fn usage_event_parsed() {
        let v = json!({
            "usageMetadata": { "promptTokenCount": 100, "candidatesTokenCount": 50 }
        });
        assert!(matches!(
            parse_gemini_chunk(&v),
            ResponseEvent::Usage { input_tokens: 100, output_tokens: 50 }
        ));
    }

    #[test]
    fn text_delta_parsed() {
        let v = json!({
            "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }]
        });
        assert!(matches!(parse_gemini_chunk(&v), ResponseEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn finish_reason_without_parts_is_done() {
        let v = json!({ "candidates": [{ "finishReason": "STOP" }] });
        assert!(matches!(parse_gemini_chunk(&v), ResponseEvent::Done));
    }

    #[tokio::test]
    async fn missing_key_is_typed_error() {
        let p = GoogleProvider::new("gemini-2.0-flash".into(), None, None, None, None);
        let err = match p.complete(CompletionRequest::oneshot("s", "u")).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, LlmError::MissingApiKey(hint) if hint == "GEMINI_API_KEY"));
    }

    #[tokio::test]
    async fn oneshot_joins_parts() {
        use futures::StreamExt;
        let v = json!({
            "candidates": [{ "content": { "parts": [{ "text": "x" }, { "text": "y" }] } }],
            "usageMetadata": { "promptTokenCount": 1, "candidatesTokenCount": 1 }
        });
        let mut s = oneshot_into_stream(&v);
        let first = s.next().await.unwrap().unwrap();
        assert!(matches!(first, ResponseEvent::TextDelta(t) if t == "xy"));
    }
}
