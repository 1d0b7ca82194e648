// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Free-talker: the free-pass path.
//!
//! Streams the LLM reply directly — no classifier, no clarify loop, no
//! observer fan-out.  History is rendered as alternating sender-tagged
//! lines ahead of the current question.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use solva_bus::{Bus, BusExt, Egress, Envelope, HistoryMessage, Ingress};
use solva_config::AgentPrompts;
use solva_model::{CompletionRequest, Gateway, Message};

use crate::names;
use crate::runner::Agent;

const DEFAULT_SYSTEM_PROMPT: &str =
    "필요할 때만 수학 수식을 LaTeX 형식($수식$)으로 작성해주세요.";

const FREEPASS_ERROR_MESSAGE: &str = "프리토커 에이전트에서 오류가 발생했습니다.";

pub struct FreeTalkerAgent {
    bus: Arc<dyn Bus>,
    gateway: Gateway,
    max_tokens: u32,
    system_prompt: String,
}

impl FreeTalkerAgent {
    pub fn new(
        bus: Arc<dyn Bus>,
        gateway: Gateway,
        max_tokens: u32,
        prompts: Option<&AgentPrompts>,
    ) -> Self {
        let system_prompt = prompts
            .and_then(|p| p.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        Self {
            bus,
            gateway,
            max_tokens,
            system_prompt,
        }
    }

    async fn talk(
        &self,
        envelope: &Envelope,
        question: String,
        history: Option<Vec<HistoryMessage>>,
    ) -> anyhow::Result<()> {
        let session_id = envelope.session_id.clone().unwrap_or_default();
        let request_id = envelope.request_id.clone().unwrap_or_default();
        let reply = Envelope::from_agent(names::FREETALKER, &session_id, &request_id);
        let start = Instant::now();

        let prompt = compose_prompt(&question, history.as_deref().unwrap_or(&[]));
        let request = CompletionRequest {
            messages: vec![
                Message::system(self.system_prompt.clone()),
                Message::user(prompt),
            ],
            stream: true,
            max_tokens: Some(self.max_tokens),
        };

        let mut stream = match self.gateway.stream(request).await {
            Ok(s) => s,
            Err(e) => {
                self.publish_error(&reply, e.to_string()).await;
                return Ok(());
            }
        };

        let mut full_response = String::new();
        let mut chunk_index: u32 = 0;

        while let Some(event) = stream.next().await {
            match event {
                Ok(solva_model::ResponseEvent::TextDelta(content)) => {
                    if content.is_empty() {
                        continue;
                    }
                    chunk_index += 1;
                    full_response.push_str(&content);
                    self.bus
                        .publish_egress(
                            &reply,
                            &Egress::FreepassChunk {
                                content,
                                chunk_index,
                            },
                        )
                        .await?;
                }
                Ok(solva_model::ResponseEvent::Done) => break,
                Ok(solva_model::ResponseEvent::Usage { .. }) => {}
                Ok(solva_model::ResponseEvent::Error(message)) => {
                    self.publish_error(&reply, message).await;
                    return Ok(());
                }
                Err(e) => {
                    self.publish_error(&reply, e.to_string()).await;
                    return Ok(());
                }
            }
        }

        if full_response.is_empty() {
            self.publish_error(&reply, "빈 응답을 받았습니다".to_string()).await;
            return Ok(());
        }

        let elapsed = start.elapsed().as_secs_f64();
        info!(
            session_id,
            request_id,
            total_chunks = chunk_index,
            elapsed_seconds = elapsed,
            "freepass reply streamed"
        );
        self.bus
            .publish_egress(
                &reply,
                &Egress::StreamingComplete {
                    full_response,
                    total_chunks: chunk_index,
                    processing_time_seconds: elapsed,
                },
            )
            .await?;
        Ok(())
    }

    async fn publish_error(&self, reply: &Envelope, error: String) {
        warn!(
            session_id = reply.session_id.as_deref().unwrap_or("-"),
            "freepass request failed: {error}"
        );
        if let Err(e) = self
            .bus
            .publish_egress(
                reply,
                &Egress::FreepassError {
                    error,
                    message: FREEPASS_ERROR_MESSAGE.to_string(),
                },
            )
            .await
        {
            warn!("freepass_error not published: {e}");
        }
    }
}

/// Render history as alternating sender-tagged lines with the current
/// question last.
fn compose_prompt(question: &str, history: &[HistoryMessage]) -> String {
    let mut prompt = String::new();
    for message in history {
        let speaker = if message.role == "user" { "사용자" } else { "AI" };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push_str("\n\n");
    }
    prompt.push_str("사용자: ");
    prompt.push_str(question);
    prompt
}

#[async_trait]
impl Agent for FreeTalkerAgent {
    fn name(&self) -> &'static str {
        names::FREETALKER
    }

    // The short alias survives from older backend builds.
    fn accepts(&self, target: &str) -> bool {
        target == self.name() || target == "FreeTalker"
    }

    async fn handle(&self, envelope: Envelope, payload: Ingress) -> anyhow::Result<()> {
        match payload {
            Ingress::FreepassRequest {
                question,
                conversation_history,
                ..
            } => self.talk(&envelope, question, conversation_history).await,
            _ => Ok(()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use solva_bus::topology::session_egress_stream;
    use solva_bus::MemoryBus;
    use solva_model::ScriptedProvider;
    use std::time::Duration;

    fn gateway(provider: ScriptedProvider) -> Gateway {
        Gateway::new(Arc::new(provider)).with_retry(1, Duration::from_millis(1))
    }

    async fn drain(bus: &MemoryBus, session: &str) -> Vec<solva_bus::StreamEntry> {
        let stream = session_egress_stream(session);
        bus.ensure_group(&stream, "test").await.unwrap();
        bus.read_group(&stream, "test", "t", 64, Duration::from_millis(10))
            .await
            .unwrap()
    }

    #[test]
    fn compose_prompt_renders_history_with_speaker_tags() {
        let history = vec![
            HistoryMessage {
                role: "user".into(),
                content: "안녕".into(),
            },
            HistoryMessage {
                role: "assistant".into(),
                content: "안녕하세요".into(),
            },
        ];
        let prompt = compose_prompt("sin x의 도함수는?", &history);
        assert!(prompt.starts_with("사용자: 안녕\n\nAI: 안녕하세요\n\n"));
        assert!(prompt.ends_with("사용자: sin x의 도함수는?"));
    }

    #[test]
    fn compose_prompt_without_history_is_just_the_question() {
        assert_eq!(compose_prompt("질문", &[]), "사용자: 질문");
    }

    #[test]
    fn accepts_both_names() {
        let bus = Arc::new(MemoryBus::new());
        let agent = FreeTalkerAgent::new(
            bus,
            gateway(ScriptedProvider::new(vec![])),
            4000,
            None,
        );
        assert!(agent.accepts("FreeTalkerAgent"));
        assert!(agent.accepts("FreeTalker"));
        assert!(!agent.accepts("ObserverAgent"));
    }

    #[tokio::test]
    async fn happy_path_streams_chunks_then_complete() {
        let bus = Arc::new(MemoryBus::new());
        let agent = FreeTalkerAgent::new(
            bus.clone(),
            gateway(ScriptedProvider::new(vec![ScriptedProvider::chunked_script([
                "cos", " x",
            ])])),
            4000,
            None,
        );

        let env = Envelope::to_agent(names::FREETALKER, "s-fp", "r-1");
        let msg = Ingress::FreepassRequest {
            question: "sin x의 도함수는?".into(),
            conversation_history: None,
            message_id: None,
        };
        agent.handle(env, msg).await.unwrap();

        let entries = drain(&bus, "s-fp").await;
        let types: Vec<&str> = entries.iter().map(|e| e.fields["type"].as_str()).collect();
        assert_eq!(types, vec!["freepass_chunk", "freepass_chunk", "streaming_complete"]);
        assert_eq!(entries[0].fields["chunk_index"], "1");
        assert_eq!(entries[1].fields["chunk_index"], "2");
        assert_eq!(entries[2].fields["full_response"], "cos x");
        assert_eq!(entries[2].fields["total_chunks"], "2");
    }

    #[tokio::test]
    async fn provider_failure_emits_freepass_error() {
        let bus = Arc::new(MemoryBus::new());
        let provider = ScriptedProvider::new(vec![]);
        provider.fail_next("down");
        let agent = FreeTalkerAgent::new(bus.clone(), gateway(provider), 4000, None);

        let env = Envelope::to_agent(names::FREETALKER, "s-fperr", "r-1");
        let msg = Ingress::FreepassRequest {
            question: "q".into(),
            conversation_history: None,
            message_id: None,
        };
        agent.handle(env, msg).await.unwrap();

        let entries = drain(&bus, "s-fperr").await;
        assert_eq!(entries[0].fields["type"], "freepass_error");
        assert_eq!(entries[0].fields["message"], FREEPASS_ERROR_MESSAGE);
    }
}
