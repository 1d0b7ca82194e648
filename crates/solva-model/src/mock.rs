// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::provider::ResponseStream;
use crate::{CompletionRequest, LlmError, ResponseEvent, Role};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, LlmError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<Result<ResponseEvent, LlmError>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// response script from the front of the queue, so tests can specify
/// exact event sequences — including mid-stream failures — without
/// network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `complete()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// When set, the next `complete()` call fails before any stream opens.
    fail_next: Arc<Mutex<Option<String>>>,
}

impl ScriptedProvider {
    /// Build a provider from a list of response scripts.  The outer `Vec`
    /// is the ordered list of calls; the inner `Vec` is the sequence of
    /// [`ResponseEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            fail_next: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// One script that streams `reply` as a single delta and finishes.
    pub fn text_script(reply: impl Into<String>) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::TextDelta(reply.into()),
            ResponseEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
            ResponseEvent::Done,
        ]
    }

    /// One script that streams each given delta in order and finishes.
    pub fn chunked_script<I, S>(chunks: I) -> Vec<ResponseEvent>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut events: Vec<ResponseEvent> = chunks
            .into_iter()
            .map(|c| ResponseEvent::TextDelta(c.into()))
            .collect();
        events.push(ResponseEvent::Usage {
            input_tokens: 5,
            output_tokens: 5,
        });
        events.push(ResponseEvent::Done);
        events
    }

    /// Append another script to the queue.
    pub fn push_script(&self, script: Vec<ResponseEvent>) {
        self.scripts.lock().unwrap().push(script);
    }

    /// Make the next `complete()` call fail before the stream opens.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock().unwrap() = Some(message.into());
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, LlmError> {
        *self.last_request.lock().unwrap() = Some(req);
        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(LlmError::Api {
                provider: "scripted-mock".into(),
                status: 500,
                message,
            });
        }
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<ResponseEvent, LlmError>> =
            events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{CompletionRequest, Message, ModelProvider, ResponseEvent};

    fn req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            stream: true,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let mut stream = p.complete(req()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            ResponseEvent::TextDelta(t) => assert!(t.contains("MOCK: hi")),
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_ends_with_done() {
        let p = MockProvider;
        let mut stream = p.complete(req()).await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(matches!(events.last(), Some(ResponseEvent::Done)));
    }

    #[tokio::test]
    async fn scripted_replays_chunks_in_order() {
        let p = ScriptedProvider::new(vec![ScriptedProvider::chunked_script(["a", "b", "c"])]);
        let mut stream = p.complete(req()).await.unwrap();
        let mut deltas = Vec::new();
        while let Some(ev) = stream.next().await {
            if let ResponseEvent::TextDelta(t) = ev.unwrap() {
                deltas.push(t);
            }
        }
        assert_eq!(deltas, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedProvider::always_text("ok");
        let _ = p.complete(req()).await.unwrap();
        let last = p.last_request.lock().unwrap();
        assert_eq!(last.as_ref().unwrap().messages[0].content, "hi");
    }

    #[tokio::test]
    async fn scripted_fail_next_errors_before_stream() {
        let p = ScriptedProvider::always_text("ok");
        p.fail_next("boom");
        let err = match p.complete(req()).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, LlmError::Api { status: 500, .. }));
        // The queued script is still there for the next call.
        assert!(p.complete(req()).await.is_ok());
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedProvider::new(vec![]);
        let mut stream = p.complete(req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t.contains("no more scripts")));
    }
}
