// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Answer generator.
//!
//! Streams the final answer: each provider delta becomes one
//! `answer_chunk` on the session egress with a strictly increasing
//! `chunk_index` starting at 1, terminated by `streaming_complete`
//! carrying the full concatenated response.  No buffering sits between
//! the provider and the bus; chunks are published as they arrive.
//! A mid-stream provider failure reports whatever accumulated so far.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use solva_bus::{Bus, BusExt, ClassificationRecord, Egress, Envelope, Ingress, Quality};
use solva_config::AgentPrompts;
use solva_model::{CompletionRequest, Gateway, Message, PromptTemplate};

use crate::names;
use crate::runner::Agent;

const DEFAULT_SYSTEM_PROMPT: &str = "\
당신은 수학 교육 전문가입니다.

역할:
- 학생의 수학 질문에 대해 체계적이고 교육적인 답변을 생성합니다.
- 한국 고등학교 교육과정 수준에 맞춰 답변합니다.

답변 원칙:
- 단계별 설명으로 복잡한 개념을 단순화합니다.
- 학생의 수준에 맞는 용어와 설명을 사용합니다.
- 수식은 LaTeX 형식($수식$)으로 작성합니다.
- 한국어로 자연스럽게 표현합니다.

답변 톤:
고등학생이 이해하기 쉽고 친근한 톤으로 답변해주세요.";

const DEFAULT_USER_TEMPLATE: &str = "\
## 학생 질문
{question}

## 질문 정보
- 질문 유형: {knowledge_code}
- 분류 결과: {answerability}
- 명료화 정보: {context}";

pub struct GeneratorAgent {
    bus: Arc<dyn Bus>,
    gateway: Gateway,
    max_tokens: u32,
    template: PromptTemplate,
}

impl GeneratorAgent {
    pub fn new(
        bus: Arc<dyn Bus>,
        gateway: Gateway,
        max_tokens: u32,
        prompts: Option<&AgentPrompts>,
    ) -> Self {
        let system = prompts
            .and_then(|p| p.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let user = prompts
            .and_then(|p| p.user_prompt("answer").map(|s| s.to_string()))
            .unwrap_or_else(|| DEFAULT_USER_TEMPLATE.to_string());
        Self {
            bus,
            gateway,
            max_tokens,
            template: PromptTemplate::new(system, user),
        }
    }

    async fn generate(
        &self,
        envelope: &Envelope,
        question: String,
        context: Option<String>,
        classification: ClassificationRecord,
    ) -> anyhow::Result<()> {
        let session_id = envelope.session_id.clone().unwrap_or_default();
        let request_id = envelope.request_id.clone().unwrap_or_default();
        let reply = Envelope::from_agent(names::GENERATOR, &session_id, &request_id);
        let start = Instant::now();

        // Non-answerable questions get a single polite decline — the
        // terminal shape stays identical so the relay needs no special
        // case.
        if classification.quality != Quality::Answerable {
            let decline = format!(
                "죄송합니다. 이 질문은 현재 답변하기 어려운 상태입니다. ({})",
                classification.quality
            );
            self.bus
                .publish_egress(
                    &reply,
                    &Egress::AnswerResult {
                        answer: decline.clone(),
                        knowledge_code: classification.knowledge_code.clone(),
                        answerability: classification.quality,
                    },
                )
                .await?;
            self.bus
                .publish_egress(
                    &reply,
                    &Egress::StreamingComplete {
                        full_response: decline,
                        total_chunks: 0,
                        processing_time_seconds: start.elapsed().as_secs_f64(),
                    },
                )
                .await?;
            return Ok(());
        }

        let mut vars = HashMap::new();
        vars.insert("question", question.clone());
        vars.insert("knowledge_code", classification.knowledge_code.clone());
        vars.insert("answerability", classification.quality.to_string());
        vars.insert(
            "context",
            context.filter(|c| !c.is_empty()).unwrap_or_else(|| "없음".into()),
        );
        let rendered = match self.template.render(&vars) {
            Ok(r) => r,
            Err(e) => {
                self.publish_error(&reply, e.to_string(), String::new()).await;
                return Ok(());
            }
        };

        // Informational breadcrumb; the relay filters these from clients.
        let _ = self
            .bus
            .publish_egress(
                &reply,
                &Egress::ProcessingLog {
                    agent_name: self.name().to_string(),
                    stage: "answer_generation".into(),
                    message: "답변 생성 시작".into(),
                },
            )
            .await;

        let request = CompletionRequest {
            messages: vec![Message::system(rendered.system), Message::user(rendered.user)],
            stream: true,
            max_tokens: Some(self.max_tokens),
        };

        let mut stream = match self.gateway.stream(request).await {
            Ok(s) => s,
            Err(e) => {
                self.publish_error(&reply, e.to_string(), String::new()).await;
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
                            &Egress::AnswerChunk {
                                content,
                                chunk_index,
                            },
                        )
                        .await?;
                }
                Ok(solva_model::ResponseEvent::Done) => break,
                Ok(solva_model::ResponseEvent::Usage { .. }) => {}
                Ok(solva_model::ResponseEvent::Error(message)) => {
                    self.publish_error(&reply, message, full_response).await;
                    return Ok(());
                }
                Err(e) => {
                    self.publish_error(&reply, e.to_string(), full_response).await;
                    return Ok(());
                }
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        info!(
            session_id,
            request_id,
            total_chunks = chunk_index,
            elapsed_seconds = elapsed,
            "answer streamed"
        );
        self.bus
            .publish_egress(
                &reply,
                &Egress::StreamingComplete {
                    full_response: full_response.clone(),
                    total_chunks: chunk_index,
                    processing_time_seconds: elapsed,
                },
            )
            .await?;

        // Off-path fan-out to the observer; failure here never touches
        // the user-visible turn.
        let conversation_text =
            format!("학생 질문: {question}\n\n에이전트 답변: {full_response}");
        let env = Envelope::to_agent(names::OBSERVER, &session_id, &request_id);
        if let Err(e) = self
            .bus
            .publish_ingress(&env, &Ingress::GenerateSummary { conversation_text })
            .await
        {
            warn!(session_id, "observer fan-out failed: {e}");
        }
        Ok(())
    }

    async fn publish_error(&self, reply: &Envelope, error: String, partial: String) {
        warn!(
            session_id = reply.session_id.as_deref().unwrap_or("-"),
            "answer generation failed: {error}"
        );
        if let Err(e) = self
            .bus
            .publish_egress(
                reply,
                &Egress::AnswerError {
                    error,
                    full_response: partial,
                },
            )
            .await
        {
            warn!("answer_error not published: {e}");
        }
    }
}

#[async_trait]
impl Agent for GeneratorAgent {
    fn name(&self) -> &'static str {
        names::GENERATOR
    }

    async fn handle(&self, envelope: Envelope, payload: Ingress) -> anyhow::Result<()> {
        match payload {
            Ingress::ReadyForAnswer {
                question,
                context,
                classification_result,
            }
            | Ingress::GenerateAnswer {
                question,
                context,
                classification_result,
            } => {
                self.generate(&envelope, question, context, classification_result)
                    .await
            }
            _ => Ok(()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
