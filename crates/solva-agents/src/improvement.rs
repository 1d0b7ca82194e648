// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Question improvement / clarification agent.
//!
//! Runs a bounded multi-turn sub-dialog when the classifier flags a
//! question as `needs_clarify`: one focus at a time is probed with a
//! friendly question until every missing field is resolved or the turn
//! budget runs out, then the collected answers are composed into an
//! improved question handed to the answer generator.
//!
//! State is keyed by session: agent mode allows one in-flight request
//! per session, and the student's replies arrive over fresh HTTP
//! requests whose envelopes carry new request ids.  The original
//! request id is kept inside the state for turn correlation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use solva_bus::{Bus, BusExt, ClassificationRecord, Egress, Envelope, Ingress, Quality};
use solva_config::AgentPrompts;
use solva_model::{CompletionRequest, Gateway, PromptTemplate};
use solva_store::{ClarifyTurnRecord, Store};

use crate::names;
use crate::prompt::extract_json;
use crate::runner::Agent;

const PROBE_MAX_TOKENS: u32 = 400;

const DEFAULT_SYSTEM_PROMPT: &str = "\
당신은 학생의 수학 질문을 명료하게 다듬는 조교입니다.
학생이 부담 없이 답할 수 있는 짧고 친근한 질문을 한국어로 만듭니다.";

const DEFAULT_ASK_TEMPLATE: &str = "\
학생의 원래 질문: {question}
지금 확인할 정보: {focus}

위 정보를 알아내기 위한 친근한 질문 한 문장만 출력하세요.";

const DEFAULT_PROBE_TEMPLATE: &str = "\
학생의 원래 질문: {question}
확인 중인 정보: {focus}
학생의 답변: {answer}

학생의 답변이 해당 정보를 충분히 제공했는지 판단하고 JSON으로만 응답하세요:
{\"resolution\": \"resolved\" | \"partial\" | \"give_up\", \"next_question\": \"추가로 물을 한 문장 (partial일 때만)\"}
- resolved: 정보가 충분함
- partial: 일부만 제공됨, 같은 정보를 더 물어야 함
- give_up: 학생이 모르거나 포기함";

const DEFAULT_COMPOSE_TEMPLATE: &str = "\
학생의 원래 질문: {question}
명료화 과정에서 얻은 답변들:
{responses}

위 내용을 모두 반영한 완전한 수학 질문 한 개를 한국어 한 문단으로 작성하세요.
질문 본문만 출력하세요.";

/// How a student reply moved the current focus.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Resolved,
    Partial { next_question: Option<String> },
    GiveUp,
}

/// Mutable state for one clarify sub-dialog.
#[derive(Debug, Clone)]
struct ClarifySession {
    request_id: String,
    question: String,
    remaining: Vec<String>,
    initial_total: u32,
    responses: Vec<String>,
    turns_asked: u32,
    last_question: String,
}

pub struct ImprovementAgent {
    bus: Arc<dyn Bus>,
    gateway: Gateway,
    store: Option<Store>,
    max_turns: u32,
    ask: PromptTemplate,
    probe: PromptTemplate,
    compose: PromptTemplate,
    sessions: Mutex<HashMap<String, ClarifySession>>,
}

impl ImprovementAgent {
    pub fn new(
        bus: Arc<dyn Bus>,
        gateway: Gateway,
        store: Option<Store>,
        max_turns: u32,
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
            max_turns: max_turns.max(1),
            ask: PromptTemplate::new(system.clone(), user("ask", DEFAULT_ASK_TEMPLATE)),
            probe: PromptTemplate::new(system.clone(), user("probe", DEFAULT_PROBE_TEMPLATE)),
            compose: PromptTemplate::new(system, user("compose", DEFAULT_COMPOSE_TEMPLATE)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of clarify sub-dialogs currently in flight (test hook).
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    async fn ask_question(&self, question: &str, focus: &str) -> Result<String, String> {
        let mut vars = HashMap::new();
        vars.insert("question", question.to_string());
        vars.insert("focus", focus.to_string());
        let rendered = self.ask.render(&vars).map_err(|e| e.to_string())?;
        let completion = self
            .gateway
            .oneshot(
                CompletionRequest::oneshot(rendered.system, rendered.user)
                    .with_max_tokens(PROBE_MAX_TOKENS),
            )
            .await
            .map_err(|e| e.to_string())?;
        let text = completion.content.trim().to_string();
        if text.is_empty() {
            return Err("빈 명료화 질문".to_string());
        }
        Ok(text)
    }

    async fn probe_resolution(
        &self,
        question: &str,
        focus: &str,
        answer: &str,
    ) -> Result<Resolution, String> {
        let mut vars = HashMap::new();
        vars.insert("question", question.to_string());
        vars.insert("focus", focus.to_string());
        vars.insert("answer", answer.to_string());
        let rendered = self.probe.render(&vars).map_err(|e| e.to_string())?;
        let completion = self
            .gateway
            .oneshot(
                CompletionRequest::oneshot(rendered.system, rendered.user)
                    .with_max_tokens(PROBE_MAX_TOKENS),
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(parse_resolution(&completion.content))
    }

    async fn compose_improved(&self, question: &str, responses: &[String]) -> String {
        let joined = responses
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {r}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let mut vars = HashMap::new();
        vars.insert("question", question.to_string());
        vars.insert("responses", joined.clone());
        let fallback = || format!("{question}\n\n추가 정보:\n{joined}");
        let Ok(rendered) = self.compose.render(&vars) else {
            return fallback();
        };
        match self
            .gateway
            .oneshot(CompletionRequest::oneshot(rendered.system, rendered.user))
            .await
        {
            Ok(c) if !c.content.trim().is_empty() => c.content.trim().to_string(),
            _ => fallback(),
        }
    }

    async fn persist_turn(&self, state: &ClarifySession, focus: &str, response: Option<&str>) {
        let Some(store) = &self.store else { return };
        let Ok(request_id) = Uuid::parse_str(&state.request_id) else {
            return;
        };
        let turn = ClarifyTurnRecord {
            request_id,
            turn_number: state.turns_asked as i32,
            focus: focus.to_string(),
            question: state.last_question.clone(),
            student_response: response.map(|s| s.to_string()),
        };
        if let Err(e) = store.save_clarify_turn(&turn).await {
            warn!(request_id = %request_id, "clarify turn not persisted: {e}");
        }
    }

    /// Look up the classification produced earlier in this turn so the
    /// generator sees the real record; a missing row falls back to the
    /// default answerable record.
    async fn classification_for(&self, request_id: &str) -> ClassificationRecord {
        let record = ClassificationRecord {
            quality: Quality::Answerable,
            ..ClassificationRecord::default()
        };
        let Some(store) = &self.store else {
            return record;
        };
        let Ok(id) = Uuid::parse_str(request_id) else {
            return record;
        };
        match store.classification(id).await {
            Ok(Some(row)) => ClassificationRecord {
                knowledge_code: row.knowledge_code,
                quality: Quality::Answerable,
                missing_fields: Vec::new(),
                unit_tags: row.unit_tags,
                reasoning: row.reasoning,
            },
            _ => record,
        }
    }

    async fn emit_error(&self, session_id: &str, request_id: &str, error: String) {
        warn!(session_id, "clarification error: {error}");
        let reply = Envelope::from_agent(names::IMPROVEMENT, session_id, request_id);
        if let Err(e) = self
            .bus
            .publish_egress(&reply, &Egress::ClarificationError { error })
            .await
        {
            warn!(session_id, "clarification_error not published: {e}");
        }
    }

    async fn begin(
        &self,
        envelope: &Envelope,
        missing_fields: Vec<String>,
        question: String,
    ) -> anyhow::Result<()> {
        let session_id = envelope.session_id.clone().unwrap_or_default();
        let request_id = envelope.request_id.clone().unwrap_or_default();

        if missing_fields.is_empty() {
            // Nothing to clarify; hand the question straight over.
            return self
                .finalize(
                    &session_id,
                    ClarifySession {
                        request_id,
                        question,
                        remaining: Vec::new(),
                        initial_total: 0,
                        responses: Vec::new(),
                        turns_asked: 0,
                        last_question: String::new(),
                    },
                )
                .await;
        }

        let focus = missing_fields[0].clone();
        let first_question = match self.ask_question(&question, &focus).await {
            Ok(q) => q,
            Err(e) => {
                self.emit_error(&session_id, &request_id, e).await;
                return Ok(());
            }
        };

        let state = ClarifySession {
            request_id: request_id.clone(),
            question,
            initial_total: missing_fields.len() as u32,
            remaining: missing_fields.clone(),
            responses: Vec::new(),
            turns_asked: 1,
            last_question: first_question.clone(),
        };
        self.persist_turn(&state, &focus, None).await;

        let reply = Envelope::from_agent(names::IMPROVEMENT, &session_id, &request_id);
        self.bus
            .publish_egress(
                &reply,
                &Egress::ClarificationQuestion {
                    question: first_question,
                    question_index: 1,
                    total_questions: state.initial_total,
                    missing_fields,
                },
            )
            .await?;

        info!(session_id, request_id, "clarification started");
        self.sessions.lock().unwrap().insert(session_id, state);
        Ok(())
    }

    async fn on_response(&self, envelope: &Envelope, answer: String) -> anyhow::Result<()> {
        let session_id = envelope.session_id.clone().unwrap_or_default();
        let active = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&session_id).cloned()
        };
        let Some(mut state) = active else {
            let request_id = envelope.request_id.clone().unwrap_or_default();
            self.emit_error(
                &session_id,
                &request_id,
                "진행 중인 명료화가 없습니다".to_string(),
            )
            .await;
            return Ok(());
        };

        let focus = state.remaining.first().cloned().unwrap_or_default();
        state.responses.push(answer.clone());
        self.persist_turn(&state, &focus, Some(&answer)).await;

        let resolution = match self
            .probe_resolution(&state.question, &focus, &answer)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.sessions.lock().unwrap().remove(&session_id);
                self.emit_error(&session_id, &state.request_id, e).await;
                return Ok(());
            }
        };

        let mut next_question_hint = None;
        match resolution {
            Resolution::Resolved | Resolution::GiveUp => {
                if !state.remaining.is_empty() {
                    state.remaining.remove(0);
                }
            }
            Resolution::Partial { next_question } => next_question_hint = next_question,
        }

        if state.remaining.is_empty() || state.turns_asked >= self.max_turns {
            self.sessions.lock().unwrap().remove(&session_id);
            return self.finalize(&session_id, state).await;
        }

        let focus = state.remaining[0].clone();
        let question = match next_question_hint {
            Some(q) if !q.trim().is_empty() => q,
            _ => match self.ask_question(&state.question, &focus).await {
                Ok(q) => q,
                Err(e) => {
                    self.sessions.lock().unwrap().remove(&session_id);
                    self.emit_error(&session_id, &state.request_id, e).await;
                    return Ok(());
                }
            },
        };

        state.turns_asked += 1;
        state.last_question = question.clone();
        self.persist_turn(&state, &focus, None).await;

        let reply = Envelope::from_agent(names::IMPROVEMENT, &session_id, &state.request_id);
        self.bus
            .publish_egress(
                &reply,
                &Egress::ClarificationQuestion {
                    question,
                    question_index: state.turns_asked,
                    total_questions: state.initial_total,
                    missing_fields: state.remaining.clone(),
                },
            )
            .await?;

        self.sessions.lock().unwrap().insert(session_id, state);
        Ok(())
    }

    /// Compose the improved question and hand the turn to the generator.
    async fn finalize(&self, session_id: &str, state: ClarifySession) -> anyhow::Result<()> {
        let improved = if state.responses.is_empty() {
            state.question.clone()
        } else {
            self.compose_improved(&state.question, &state.responses).await
        };

        info!(
            session_id,
            request_id = %state.request_id,
            turns = state.turns_asked,
            "clarification complete"
        );

        let reply = Envelope::from_agent(names::IMPROVEMENT, session_id, &state.request_id);
        self.bus
            .publish_egress(
                &reply,
                &Egress::ClarificationComplete {
                    improved_question: improved.clone(),
                    user_responses: state.responses.clone(),
                },
            )
            .await?;

        let classification = self.classification_for(&state.request_id).await;
        let env = Envelope::to_agent(names::GENERATOR, session_id, &state.request_id);
        self.bus
            .publish_ingress(
                &env,
                &Ingress::ReadyForAnswer {
                    question: improved,
                    context: Some(state.question),
                    classification_result: classification,
                },
            )
            .await?;
        Ok(())
    }
}

fn parse_resolution(content: &str) -> Resolution {
    let Some(json) = extract_json(content) else {
        // Unparseable probe verdicts count the focus as resolved so the
        // loop always makes progress.
        return Resolution::Resolved;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&json) else {
        return Resolution::Resolved;
    };
    match value["resolution"].as_str() {
        Some("partial") => Resolution::Partial {
            next_question: value["next_question"].as_str().map(|s| s.to_string()),
        },
        Some("give_up") => Resolution::GiveUp,
        _ => Resolution::Resolved,
    }
}

#[async_trait]
impl Agent for ImprovementAgent {
    fn name(&self) -> &'static str {
        names::IMPROVEMENT
    }

    async fn handle(&self, envelope: Envelope, payload: Ingress) -> anyhow::Result<()> {
        match payload {
            Ingress::NeedsClarify {
                missing_fields,
                question,
            } => self.begin(&envelope, missing_fields, question).await,
            Ingress::UserClarificationResponse {
                clarification_answer,
                ..
            } => self.on_response(&envelope, clarification_answer).await,
            Ingress::ProcessClarification { clarification, .. } => {
                let answer = clarification["clarification_answer"]
                    .as_str()
                    .or_else(|| clarification["answer"].as_str())
                    .or_else(|| clarification["response"].as_str());
                match answer {
                    Some(a) => self.on_response(&envelope, a.to_string()).await,
                    None => {
                        warn!("process_clarification without an answer field");
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use solva_bus::topology::{session_egress_stream, INGRESS_STREAM};
    use solva_bus::MemoryBus;
    use solva_model::ScriptedProvider;
    use std::time::Duration;

    fn gateway(scripts: Vec<Vec<solva_model::ResponseEvent>>) -> Gateway {
        Gateway::new(Arc::new(ScriptedProvider::new(scripts)))
            .with_retry(1, Duration::from_millis(1))
    }

    fn text(s: &str) -> Vec<solva_model::ResponseEvent> {
        ScriptedProvider::text_script(s)
    }

    async fn drain_egress(bus: &MemoryBus, session: &str) -> Vec<(String, String)> {
        let stream = session_egress_stream(session);
        bus.ensure_group(&stream, "test").await.unwrap();
        let entries = bus
            .read_group(&stream, "test", "t", 64, Duration::from_millis(10))
            .await
            .unwrap();
        entries
            .iter()
            .map(|e| {
                (
                    e.fields["type"].clone(),
                    e.fields.get("question").cloned().unwrap_or_default(),
                )
            })
            .collect()
    }

    fn needs_clarify(session: &str, request: &str, fields: &[&str]) -> (Envelope, Ingress) {
        (
            Envelope::to_agent(names::IMPROVEMENT, session, request),
            Ingress::NeedsClarify {
                missing_fields: fields.iter().map(|s| s.to_string()).collect(),
                question: "이거 어떻게 풀어?".into(),
            },
        )
    }

    fn response(session: &str, answer: &str) -> (Envelope, Ingress) {
        (
            Envelope::to_agent(names::IMPROVEMENT, session, Uuid::new_v4().to_string()),
            Ingress::UserClarificationResponse {
                clarification_answer: answer.into(),
                question_index: 1,
                total_questions: 2,
            },
        )
    }

    #[tokio::test]
    async fn two_field_dialog_runs_to_completion() {
        let bus = Arc::new(MemoryBus::new());
        let agent = ImprovementAgent::new(
            bus.clone(),
            gateway(vec![
                text("어떤 문제인지 알려줄래요?"),            // ask #1
                text(r#"{"resolution": "resolved"}"#),        // probe #1
                text("문제의 식을 적어줄 수 있나요?"),        // ask #2
                text(r#"{"resolution": "resolved"}"#),        // probe #2
                text("이차방정식 x^2-5x+6=0을 풀이하는 문제"), // compose
            ]),
            None,
            3,
            None,
        );

        let (env, msg) = needs_clarify("s-clar", "11111111-1111-4111-8111-111111111111", &["problem_text", "topic"]);
        agent.handle(env, msg).await.unwrap();
        assert_eq!(agent.active_sessions(), 1);

        let events = drain_egress(&bus, "s-clar").await;
        assert_eq!(events[0].0, "clarification_question");

        let (env, msg) = response("s-clar", "이차방정식이야");
        agent.handle(env, msg).await.unwrap();
        let events = drain_egress(&bus, "s-clar").await;
        assert_eq!(events[0].0, "clarification_question");

        let (env, msg) = response("s-clar", "x^2-5x+6=0");
        agent.handle(env, msg).await.unwrap();
        let events = drain_egress(&bus, "s-clar").await;
        assert_eq!(events[0].0, "clarification_complete");
        assert_eq!(agent.active_sessions(), 0);

        // The improved question went to the generator with the original
        // request id.
        bus.ensure_group(INGRESS_STREAM, "t").await.unwrap();
        let ingress = bus
            .read_group(INGRESS_STREAM, "t", "t", 8, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].fields["type"], "ready_for_answer");
        assert_eq!(ingress[0].fields["target_agent"], names::GENERATOR);
        assert_eq!(
            ingress[0].fields["request_id"],
            "11111111-1111-4111-8111-111111111111"
        );
    }

    #[tokio::test]
    async fn turn_budget_forces_finalization() {
        let bus = Arc::new(MemoryBus::new());
        // Every probe says "partial", so only the budget can end the loop.
        let agent = ImprovementAgent::new(
            bus.clone(),
            gateway(vec![
                text("q1"),
                text(r#"{"resolution": "partial", "next_question": "q2"}"#),
                text(r#"{"resolution": "partial", "next_question": "q3"}"#),
                text("합성된 질문"),
            ]),
            None,
            2,
            None,
        );

        let (env, msg) = needs_clarify("s-budget", "22222222-2222-4222-8222-222222222222", &["scope"]);
        agent.handle(env, msg).await.unwrap();

        let (env, msg) = response("s-budget", "음...");
        agent.handle(env, msg).await.unwrap();
        let events = drain_egress(&bus, "s-budget").await;
        // Turn 2 of 2 — one more question allowed.
        assert!(events.iter().any(|(t, _)| t == "clarification_question"));

        let (env, msg) = response("s-budget", "아직도 모르겠어");
        agent.handle(env, msg).await.unwrap();
        let events = drain_egress(&bus, "s-budget").await;
        assert!(
            events.iter().any(|(t, _)| t == "clarification_complete"),
            "exceeding max_turns must force clarification_complete, got {events:?}"
        );
        assert_eq!(agent.active_sessions(), 0);
    }

    #[tokio::test]
    async fn give_up_moves_to_next_focus() {
        let bus = Arc::new(MemoryBus::new());
        let agent = ImprovementAgent::new(
            bus.clone(),
            gateway(vec![
                text("q1"),
                text(r#"{"resolution": "give_up"}"#),
                text("q2"),
            ]),
            None,
            5,
            None,
        );

        let (env, msg) = needs_clarify("s-skip", "33333333-3333-4333-8333-333333333333", &["a", "b"]);
        agent.handle(env, msg).await.unwrap();
        drain_egress(&bus, "s-skip").await;

        let (env, msg) = response("s-skip", "모르겠어요");
        agent.handle(env, msg).await.unwrap();
        let events = drain_egress(&bus, "s-skip").await;
        assert_eq!(events[0].0, "clarification_question", "focus b is probed next");
    }

    #[tokio::test]
    async fn response_without_active_dialog_is_an_error_event() {
        let bus = Arc::new(MemoryBus::new());
        let agent = ImprovementAgent::new(bus.clone(), gateway(vec![]), None, 3, None);

        let (env, msg) = response("s-none", "답변");
        agent.handle(env, msg).await.unwrap();
        let events = drain_egress(&bus, "s-none").await;
        assert_eq!(events[0].0, "clarification_error");
    }

    #[tokio::test]
    async fn llm_failure_during_ask_emits_clarification_error() {
        let bus = Arc::new(MemoryBus::new());
        let provider = ScriptedProvider::new(vec![]);
        provider.fail_next("provider down");
        let agent = ImprovementAgent::new(
            bus.clone(),
            Gateway::new(Arc::new(provider)).with_retry(1, Duration::from_millis(1)),
            None,
            3,
            None,
        );

        let (env, msg) = needs_clarify("s-err", "44444444-4444-4444-8444-444444444444", &["x"]);
        agent.handle(env, msg).await.unwrap();
        let events = drain_egress(&bus, "s-err").await;
        assert_eq!(events[0].0, "clarification_error");
        assert_eq!(agent.active_sessions(), 0);
    }

    #[test]
    fn parse_resolution_defaults_to_resolved() {
        assert_eq!(parse_resolution("no json here"), Resolution::Resolved);
        assert_eq!(
            parse_resolution(r#"{"resolution": "give_up"}"#),
            Resolution::GiveUp
        );
        assert!(matches!(
            parse_resolution(r#"{"resolution": "partial", "next_question": "more?"}"#),
            Resolution::Partial { next_question: Some(q) } if q == "more?"
        ));
    }
}
