// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end pipeline tests: the five agents wired over the in-memory
//! bus with scripted model providers, observed through the
//! orchestrator's SSE relay.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use solva_agents::{
    names, Agent, ClassifierAgent, FreeTalkerAgent, GeneratorAgent, ImprovementAgent,
    ObserverAgent, Subscriber,
};
use solva_bus::topology::{session_egress_stream, ORCHESTRATOR_GROUP};
use solva_bus::{Bus, BusExt, Envelope, HistoryMessage, Ingress, MemoryBus};
use solva_model::{Gateway, ResponseEvent, ScriptedProvider};
use solva_server::{relay, SseFrame};

const BLOCK: Duration = Duration::from_millis(10);

fn gateway(scripts: Vec<Vec<ResponseEvent>>) -> Gateway {
    Gateway::new(Arc::new(ScriptedProvider::new(scripts))).with_retry(1, Duration::from_millis(1))
}

fn failing_gateway() -> Gateway {
    let provider = ScriptedProvider::new(vec![]);
    provider.fail_next("provider outage");
    Gateway::new(Arc::new(provider)).with_retry(1, Duration::from_millis(1))
}

fn text(s: &str) -> Vec<ResponseEvent> {
    ScriptedProvider::text_script(s)
}

fn chunks<const N: usize>(parts: [&str; N]) -> Vec<ResponseEvent> {
    ScriptedProvider::chunked_script(parts)
}

/// The full worker pool over one shared bus.
struct Pipeline {
    bus: Arc<MemoryBus>,
    subscribers: Vec<Subscriber>,
}

struct Scripts {
    classifier: Vec<Vec<ResponseEvent>>,
    improvement: Vec<Vec<ResponseEvent>>,
    generator: Vec<Vec<ResponseEvent>>,
    freetalker: Vec<Vec<ResponseEvent>>,
    observer_gateway: Option<Gateway>,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            classifier: vec![],
            improvement: vec![],
            generator: vec![],
            freetalker: vec![],
            observer_gateway: None,
        }
    }
}

impl Pipeline {
    async fn new(scripts: Scripts) -> Self {
        let bus = Arc::new(MemoryBus::new());
        let observer_gateway = scripts
            .observer_gateway
            .unwrap_or_else(|| gateway(vec![text(r#"{"conversation_summary": "요약"}"#)]));

        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(ClassifierAgent::new(
                bus.clone(),
                gateway(scripts.classifier),
                None,
                None,
            )),
            Arc::new(ImprovementAgent::new(
                bus.clone(),
                gateway(scripts.improvement),
                None,
                3,
                None,
            )),
            Arc::new(GeneratorAgent::new(
                bus.clone(),
                gateway(scripts.generator),
                2000,
                None,
            )),
            Arc::new(FreeTalkerAgent::new(
                bus.clone(),
                gateway(scripts.freetalker),
                4000,
                None,
            )),
            Arc::new(ObserverAgent::new(
                bus.clone(),
                observer_gateway,
                None,
                None,
            )),
        ];

        let mut subscribers = Vec::new();
        for agent in agents {
            let subscriber = Subscriber::new(bus.clone(), agent, BLOCK);
            subscriber.init().await.unwrap();
            subscribers.push(subscriber);
        }
        Self { bus, subscribers }
    }

    /// Drive every worker until a full round makes no progress.
    async fn pump(&self) {
        loop {
            let mut total = 0;
            for subscriber in &self.subscribers {
                total += subscriber.poll_once().await.unwrap();
            }
            if total == 0 {
                return;
            }
        }
    }

    async fn kickoff_question(&self, session: &str, question: &str) -> String {
        let request_id = Uuid::new_v4().to_string();
        let envelope = Envelope::to_agent(names::CLASSIFIER, session, &request_id);
        self.bus
            .publish_ingress(
                &envelope,
                &Ingress::ClassifyQuestion {
                    question: question.into(),
                    context: None,
                    is_new_question: Some(true),
                },
            )
            .await
            .unwrap();
        request_id
    }

    async fn send_clarification(&self, session: &str, answer: &str, index: u32, total: u32) {
        let envelope =
            Envelope::to_agent(names::IMPROVEMENT, session, Uuid::new_v4().to_string());
        self.bus
            .publish_ingress(
                &envelope,
                &Ingress::UserClarificationResponse {
                    clarification_answer: answer.into(),
                    question_index: index,
                    total_questions: total,
                },
            )
            .await
            .unwrap();
    }

    async fn kickoff_freepass(&self, session: &str, question: &str) {
        let envelope =
            Envelope::to_agent(names::FREETALKER, session, Uuid::new_v4().to_string());
        self.bus
            .publish_ingress(
                &envelope,
                &Ingress::FreepassRequest {
                    question: question.into(),
                    conversation_history: Some(vec![HistoryMessage {
                        role: "user".into(),
                        content: "안녕".into(),
                    }]),
                    message_id: None,
                },
            )
            .await
            .unwrap();
    }

    /// Collect one turn's SSE frames the way the chat handler would.
    async fn collect_turn(&self, session: &str) -> Vec<SseFrame> {
        let stream = session_egress_stream(session);
        self.bus
            .ensure_group(&stream, ORCHESTRATOR_GROUP)
            .await
            .unwrap();
        relay(
            self.bus.clone() as Arc<dyn Bus>,
            None,
            Uuid::parse_str(session).unwrap(),
            format!("orchestrator_{}", Uuid::new_v4().simple()),
            Duration::from_secs(3),
            BLOCK,
        )
        .collect()
        .await
    }
}

fn event_names(frames: &[SseFrame]) -> Vec<&str> {
    frames.iter().map(|f| f.event.as_str()).collect()
}

fn data(frame: &SseFrame) -> Value {
    serde_json::from_str(&frame.data).unwrap()
}

/// Chunk indices ride the wire stringified; parse them back.
fn chunk_index(frame: &SseFrame) -> u64 {
    data(frame)["chunk_index"].as_str().unwrap().parse().unwrap()
}

fn session_key() -> String {
    Uuid::new_v4().to_string()
}

// ── E2E: agent mode, answerable ──────────────────────────────────────────────

#[tokio::test]
async fn answerable_question_streams_classification_then_chunks() {
    let pipeline = Pipeline::new(Scripts {
        classifier: vec![text(
            r#"{"quality": "answerable", "knowledge_code": "K2", "missing_fields": []}"#,
        )],
        generator: vec![chunks(["등차수열은 ", "연속한 두 항의 차가 ", "일정한 수열입니다."])],
        ..Scripts::default()
    })
    .await;

    let session = session_key();
    pipeline
        .kickoff_question(&session, "등차수열의 정의를 설명해줘")
        .await;
    pipeline.pump().await;

    let frames = pipeline.collect_turn(&session).await;
    let names = event_names(&frames);
    assert_eq!(names[0], "classification_result");
    assert_eq!(
        data(&frames[0])["classification_result"]["knowledge_code"],
        "K2"
    );

    let chunk_frames: Vec<&SseFrame> =
        frames.iter().filter(|f| f.event == "answer_chunk").collect();
    let indices: Vec<u64> = chunk_frames.iter().map(|f| chunk_index(f)).collect();
    assert_eq!(indices, vec![1, 2, 3], "chunk indices contiguous from 1");

    let concatenated: String = chunk_frames
        .iter()
        .map(|f| data(f)["content"].as_str().unwrap().to_string())
        .collect();

    let last = frames.last().unwrap();
    assert_eq!(last.event, "streaming_complete");
    assert_eq!(data(last)["full_response"], concatenated);
    assert_eq!(data(last)["total_chunks"], Value::String("3".into()));
}

// ── E2E: needs_clarify dialog through to the answer ─────────────────────────

#[tokio::test]
async fn clarify_dialog_collects_answers_then_streams() {
    let pipeline = Pipeline::new(Scripts {
        classifier: vec![text(
            r#"{"quality": "needs_clarify", "missing_fields": ["problem_text", "topic"]}"#,
        )],
        improvement: vec![
            text("어떤 단원의 문제인가요?"),
            text(r#"{"resolution": "resolved"}"#),
            text("문제의 식을 알려줄래요?"),
            text(r#"{"resolution": "resolved"}"#),
            text("이차방정식 x^2-5x+6=0을 푸는 방법"),
        ],
        generator: vec![chunks(["근의 공식을 쓰면 ", "x=2 또는 x=3"])],
        ..Scripts::default()
    })
    .await;

    let session = session_key();
    pipeline.kickoff_question(&session, "이거 어떻게 풀어?").await;
    pipeline.pump().await;

    // Turn 1 suspends at the first clarification question.
    let frames = pipeline.collect_turn(&session).await;
    assert_eq!(
        event_names(&frames),
        vec!["classification_result", "clarification_question"]
    );
    let first = data(&frames[1]);
    assert_eq!(first["question_index"], Value::String("1".into()));
    assert_eq!(first["total_questions"], Value::String("2".into()));

    // Student answers; turn 2 suspends at the second question.
    pipeline
        .send_clarification(&session, "이차방정식이야", 1, 2)
        .await;
    pipeline.pump().await;
    let frames = pipeline.collect_turn(&session).await;
    assert_eq!(event_names(&frames), vec!["clarification_question"]);
    assert_eq!(data(&frames[0])["question_index"], Value::String("2".into()));

    // Second answer completes the clarify loop and the answer streams.
    pipeline
        .send_clarification(&session, "x^2-5x+6=0", 2, 2)
        .await;
    pipeline.pump().await;
    let frames = pipeline.collect_turn(&session).await;
    let names = event_names(&frames);
    assert_eq!(names[0], "clarification_complete");
    assert!(names.contains(&"answer_chunk"));
    assert_eq!(*names.last().unwrap(), "streaming_complete");

    let responses = data(&frames[0])["user_responses"].clone();
    assert_eq!(
        responses,
        serde_json::json!(["이차방정식이야", "x^2-5x+6=0"])
    );
}

// ── E2E: unanswerable is terminal ────────────────────────────────────────────

#[tokio::test]
async fn unanswerable_question_ends_after_classification() {
    let pipeline = Pipeline::new(Scripts {
        classifier: vec![text(
            r#"{"quality": "unanswerable", "reasoning": "수학 질문이 아님"}"#,
        )],
        ..Scripts::default()
    })
    .await;

    let session = session_key();
    pipeline.kickoff_question(&session, "오늘 날씨는?").await;
    pipeline.pump().await;

    let frames = pipeline.collect_turn(&session).await;
    assert_eq!(event_names(&frames), vec!["classification_result"]);
    assert_eq!(
        data(&frames[0])["classification_result"]["quality"],
        "unanswerable"
    );
}

// ── E2E: free-pass happy path ────────────────────────────────────────────────

#[tokio::test]
async fn freepass_streams_chunks_and_completion() {
    let pipeline = Pipeline::new(Scripts {
        freetalker: vec![chunks(["sin x의 도함수는 ", "cos x입니다."])],
        ..Scripts::default()
    })
    .await;

    let session = session_key();
    pipeline.kickoff_freepass(&session, "sin x의 도함수는?").await;
    pipeline.pump().await;

    let frames = pipeline.collect_turn(&session).await;
    assert_eq!(
        event_names(&frames),
        vec!["freepass_chunk", "freepass_chunk", "streaming_complete"]
    );
    let concatenated: String = frames[..2]
        .iter()
        .map(|f| data(f)["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(data(&frames[2])["full_response"], concatenated);
}

// ── E2E: classifier LLM failure ──────────────────────────────────────────────

#[tokio::test]
async fn classifier_empty_reply_fails_the_turn_cleanly() {
    let pipeline = Pipeline::new(Scripts {
        classifier: vec![text("")],
        ..Scripts::default()
    })
    .await;

    let session = session_key();
    pipeline.kickoff_question(&session, "질문").await;
    pipeline.pump().await;

    let frames = pipeline.collect_turn(&session).await;
    assert_eq!(event_names(&frames), vec!["classification_failed"]);
    assert_eq!(data(&frames[0])["error"], "LLM 분류 실패 - 빈 응답");
}

// ── E2E: per-session isolation under parallelism ─────────────────────────────

#[tokio::test]
async fn concurrent_sessions_never_cross_talk() {
    let pipeline = Pipeline::new(Scripts {
        classifier: vec![
            text(r#"{"quality": "answerable", "knowledge_code": "K1"}"#),
            text(r#"{"quality": "answerable", "knowledge_code": "K1"}"#),
        ],
        generator: vec![chunks(["S1a", "S1b"]), chunks(["S2a", "S2b", "S2c"])],
        ..Scripts::default()
    })
    .await;

    let s1 = session_key();
    let s2 = session_key();
    pipeline.kickoff_question(&s1, "첫 번째 세션 질문").await;
    pipeline.kickoff_question(&s2, "두 번째 세션 질문").await;
    pipeline.pump().await;

    let frames1 = pipeline.collect_turn(&s1).await;
    let frames2 = pipeline.collect_turn(&s2).await;

    for frame in &frames1 {
        assert_eq!(
            data(frame)["session_id"], s1,
            "session 1 saw a frame for another session"
        );
    }
    for frame in &frames2 {
        assert_eq!(data(frame)["session_id"], s2);
    }

    let indices = |frames: &[SseFrame]| -> Vec<u64> {
        frames
            .iter()
            .filter(|f| f.event == "answer_chunk")
            .map(chunk_index)
            .collect()
    };
    let i1 = indices(&frames1);
    let i2 = indices(&frames2);
    assert_eq!(i1, (1..=i1.len() as u64).collect::<Vec<_>>());
    assert_eq!(i2, (1..=i2.len() as u64).collect::<Vec<_>>());
    assert_eq!(event_names(&frames1).last(), Some(&"streaming_complete"));
    assert_eq!(event_names(&frames2).last(), Some(&"streaming_complete"));
}

// ── Observer outage never blocks the user-visible turn ───────────────────────

#[tokio::test]
async fn observer_outage_does_not_block_streaming_complete() {
    let pipeline = Pipeline::new(Scripts {
        classifier: vec![text(r#"{"quality": "answerable"}"#)],
        generator: vec![chunks(["답변"])],
        observer_gateway: Some(failing_gateway()),
        ..Scripts::default()
    })
    .await;

    let session = session_key();
    pipeline.kickoff_question(&session, "질문").await;
    pipeline.pump().await;

    let frames = pipeline.collect_turn(&session).await;
    assert_eq!(event_names(&frames).last(), Some(&"streaming_complete"));
}

// ── Idempotent redelivery ────────────────────────────────────────────────────

#[tokio::test]
async fn redelivered_kickoff_duplicates_the_terminal_only() {
    let pipeline = Pipeline::new(Scripts {
        classifier: vec![
            text(r#"{"quality": "unanswerable"}"#),
            text(r#"{"quality": "unanswerable"}"#),
        ],
        ..Scripts::default()
    })
    .await;

    let session = session_key();
    pipeline.kickoff_question(&session, "오늘 날씨는?").await;
    pipeline.pump().await;
    // Redelivery of the same logical message (same session, same turn).
    pipeline.kickoff_question(&session, "오늘 날씨는?").await;
    pipeline.pump().await;

    // The relay closes on the first terminal and drains the duplicate.
    let frames = pipeline.collect_turn(&session).await;
    assert_eq!(event_names(&frames), vec!["classification_result"]);

    let stream = session_egress_stream(&session);
    assert_eq!(
        pipeline
            .bus
            .pending_count(&stream, ORCHESTRATOR_GROUP)
            .await
            .unwrap(),
        0,
        "duplicate terminals must be drained and acked"
    );
}
