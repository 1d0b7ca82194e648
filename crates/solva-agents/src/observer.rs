// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Observer: off-path summarisation.
//!
//! Consumes the finalized (question, answer) pair after a turn, upserts
//! the per-session conversation summary and student status, and titles
//! untitled sessions.  The orchestrator never waits for any of this.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use solva_bus::{Bus, BusExt, Egress, Envelope, Ingress};
use solva_config::AgentPrompts;
use solva_model::{CompletionRequest, Gateway, PromptTemplate};
use solva_store::{Stage, Store, SummaryRecord};

use crate::names;
use crate::prompt::extract_json;
use crate::runner::Agent;

const SUMMARY_MAX_TOKENS: u32 = 600;
const TITLE_MAX_TOKENS: u32 = 60;

const DEFAULT_SYSTEM_PROMPT: &str = "\
당신은 수학 튜터링 대화를 관찰하는 조교입니다.
대화를 요약하고 학생의 이해 상태를 평가합니다.";

const DEFAULT_SUMMARY_TEMPLATE: &str = "\
다음 튜터링 대화를 분석하세요:

{conversation_text}

JSON으로만 응답하세요:
{\"conversation_summary\": \"불릿 형식 요약\", \"student_status\": {\"level\": \"파악된 수준\", \"needs\": \"보충이 필요한 부분\"}}";

const DEFAULT_TITLE_TEMPLATE: &str = "\
다음 대화의 제목을 10자 내외의 한국어 명사구 하나로만 출력하세요:

{conversation_text}";

pub struct ObserverAgent {
    bus: Arc<dyn Bus>,
    gateway: Gateway,
    store: Option<Store>,
    summary: PromptTemplate,
    title: PromptTemplate,
}

impl ObserverAgent {
    pub fn new(
        bus: Arc<dyn Bus>,
        gateway: Gateway,
        store: Option<Store>,
        prompts: Option<&AgentPrompts>,
    ) -> Self {
        let system = prompts
            .and_then(|p| p.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let user = |name: &str, fallback: &str| {
            prompts
                .and_then(|p| p.user_prompt(name).map(|s| s.to_string()))
                .unwrap_or_else(|| fallback.to_string())
        };
        Self {
            bus,
            gateway,
            store,
            summary: PromptTemplate::new(
                system.clone(),
                user("summary", DEFAULT_SUMMARY_TEMPLATE),
            ),
            title: PromptTemplate::new(system, user("title", DEFAULT_TITLE_TEMPLATE)),
        }
    }

    /// Summarise the conversation.  Unparseable model output degrades to
    /// the raw text as summary with an empty status object.
    async fn summarise(
        &self,
        conversation_text: &str,
    ) -> Result<(String, serde_json::Value), String> {
        let mut vars = HashMap::new();
        vars.insert("conversation_text", conversation_text.to_string());
        let rendered = self.summary.render(&vars).map_err(|e| e.to_string())?;
        let completion = self
            .gateway
            .oneshot(
                CompletionRequest::oneshot(rendered.system, rendered.user)
                    .with_max_tokens(SUMMARY_MAX_TOKENS),
            )
            .await
            .map_err(|e| e.to_string())?;

        if completion.content.trim().is_empty() {
            return Err("빈 요약 응답".to_string());
        }

        if let Some(json) = extract_json(&completion.content) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json) {
                let summary = value["conversation_summary"]
                    .as_str()
                    .unwrap_or(completion.content.trim())
                    .to_string();
                let status = value
                    .get("student_status")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                return Ok((summary, status));
            }
        }
        Ok((completion.content.trim().to_string(), serde_json::json!({})))
    }

    async fn make_title(&self, conversation_text: &str) -> Option<String> {
        let mut vars = HashMap::new();
        vars.insert("conversation_text", conversation_text.to_string());
        let rendered = self.title.render(&vars).ok()?;
        let completion = self
            .gateway
            .oneshot(
                CompletionRequest::oneshot(rendered.system, rendered.user)
                    .with_max_tokens(TITLE_MAX_TOKENS),
            )
            .await
            .ok()?;
        let title = completion.content.trim().trim_matches('"').to_string();
        (!title.is_empty()).then_some(title)
    }

    async fn persist(
        &self,
        session_id: &str,
        summary: &str,
        status: serde_json::Value,
        conversation_text: &str,
    ) {
        let Some(store) = &self.store else { return };
        let Ok(session_uuid) = Uuid::parse_str(session_id) else {
            return;
        };

        let record = SummaryRecord {
            session_id: session_uuid,
            conversation_summary: summary.to_string(),
            student_status: status,
        };
        if let Err(e) = store.upsert_summary(&record).await {
            warn!(session_id, "summary not persisted: {e}");
        }

        // Title only sessions that have none yet.
        let has_title = matches!(store.title(session_uuid).await, Ok(Some(_)));
        if !has_title {
            if let Some(title) = self.make_title(conversation_text).await {
                if let Err(e) = store.upsert_title(session_uuid, &title).await {
                    warn!(session_id, "title not persisted: {e}");
                } else if let Err(e) = store.set_title(session_uuid, &title).await {
                    warn!(session_id, "session title not updated: {e}");
                }
            }
        }

        if let Err(e) = store.advance_stage(session_uuid, Stage::Summarized).await {
            warn!(session_id, "stage not advanced: {e}");
        }
    }
}

#[async_trait]
impl Agent for ObserverAgent {
    fn name(&self) -> &'static str {
        names::OBSERVER
    }

    async fn handle(&self, envelope: Envelope, payload: Ingress) -> anyhow::Result<()> {
        let Ingress::GenerateSummary { conversation_text } = payload else {
            return Ok(());
        };
        let session_id = envelope.session_id.clone().unwrap_or_default();
        let request_id = envelope.request_id.clone().unwrap_or_default();

        match self.summarise(&conversation_text).await {
            Ok((summary, status)) => {
                info!(session_id, "conversation summarised");
                self.persist(&session_id, &summary, status, &conversation_text)
                    .await;
                let reply = Envelope::from_agent(names::OBSERVER, &session_id, &request_id);
                self.bus
                    .publish_egress(&reply, &Egress::SummaryResult { summary })
                    .await?;
            }
            Err(e) => {
                // Summaries are best-effort: log and move on, the turn is
                // already complete from the user's point of view.
                warn!(session_id, "summary generation failed: {e}");
            }
        }
        Ok(())
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

    fn summary_msg(session: &str) -> (Envelope, Ingress) {
        (
            Envelope::to_agent(names::OBSERVER, session, "r-1"),
            Ingress::GenerateSummary {
                conversation_text: "학생 질문: q\n\n에이전트 답변: a".into(),
            },
        )
    }

    #[tokio::test]
    async fn structured_reply_becomes_summary_result() {
        let bus = Arc::new(MemoryBus::new());
        let agent = ObserverAgent::new(
            bus.clone(),
            gateway(ScriptedProvider::always_text(
                r#"{"conversation_summary": "• 등차수열 개념 설명", "student_status": {"level": "중"}}"#,
            )),
            None,
            None,
        );

        let (env, msg) = summary_msg("s-obs");
        agent.handle(env, msg).await.unwrap();

        let stream = session_egress_stream("s-obs");
        bus.ensure_group(&stream, "t").await.unwrap();
        let entries = bus
            .read_group(&stream, "t", "t", 8, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries[0].fields["type"], "summary_result");
        assert_eq!(entries[0].fields["summary"], "• 등차수열 개념 설명");
    }

    #[tokio::test]
    async fn unstructured_reply_degrades_to_raw_text() {
        let bus = Arc::new(MemoryBus::new());
        let agent = ObserverAgent::new(
            bus.clone(),
            gateway(ScriptedProvider::always_text("그냥 산문 요약")),
            None,
            None,
        );
        let (summary, status) = agent.summarise("dialog").await.unwrap();
        assert_eq!(summary, "그냥 산문 요약");
        assert_eq!(status, serde_json::json!({}));
    }

    #[tokio::test]
    async fn llm_failure_emits_nothing() {
        let bus = Arc::new(MemoryBus::new());
        let provider = ScriptedProvider::new(vec![]);
        provider.fail_next("down");
        let agent = ObserverAgent::new(bus.clone(), gateway(provider), None, None);

        let (env, msg) = summary_msg("s-quiet");
        agent.handle(env, msg).await.unwrap();
        assert!(bus.is_empty(&session_egress_stream("s-quiet")));
    }
}
