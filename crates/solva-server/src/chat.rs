// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The chat endpoint: one POST, one SSE stream, one turn.
//!
//! The handler resolves the user's mode, creates or loads the session,
//! records the user message, publishes the kickoff onto the worker
//! ingress, and then relays the session's egress stream to the client —
//! one bus entry per SSE frame, strictly in append order, each entry
//! acked after translation.  The stream closes on the turn's terminal
//! event, on the wall-clock timeout, or when the client goes away.
//!
//! Client disconnect drops the relay future; in-flight workers are NOT
//! cancelled.  Whatever they still publish sits in the (length-capped)
//! session stream with no consumer attached, which holds no resources
//! here.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use solva_agents::names;
use solva_bus::topology::{session_egress_stream, ORCHESTRATOR_GROUP};
use solva_bus::{wire, Bus, BusExt, Egress, Envelope, HistoryMessage, Ingress};
use solva_store::{Sender, Stage, Store};

use crate::error::ServerError;
use crate::mode::MODE_AGENT;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// "question" (default) or "clarification_response".
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub conversation_history: Option<Vec<HistoryMessage>>,
    #[serde(default)]
    pub question_index: Option<u32>,
    #[serde(default)]
    pub total_questions: Option<u32>,
}

/// One translated SSE frame: the event name is the bus `type`, the data
/// is the decoded JSON object with every field forwarded verbatim.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

pub(crate) fn user_id_from_headers(headers: &HeaderMap) -> Result<String, ServerError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or(ServerError::Unauthorized)
}

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let user_id = user_id_from_headers(&headers)?;
    if request.message.trim().is_empty() {
        return Err(ServerError::Validation("질문이 비어 있습니다".into()));
    }

    let mode = state.modes.get_or_assign(&user_id).await?;

    let is_new_session = request.session_id.is_none();
    let session = match request.session_id {
        Some(id) => {
            let session = state.store.get_session(id).await?;
            if session.user_id != user_id {
                return Err(ServerError::Unauthorized);
            }
            if !session.is_active {
                return Err(ServerError::SessionNotFound);
            }
            session
        }
        None => state.store.create_session(&user_id, None).await?,
    };
    let session_id = session.session_id;
    let session_key = session_id.to_string();

    let message_type = request
        .message_type
        .clone()
        .unwrap_or_else(|| "question".to_string());
    state
        .store
        .append_message(session_id, Sender::User, &request.message, &message_type, None)
        .await?;

    let request_id = Uuid::new_v4().to_string();
    info!(
        user_id,
        session_id = %session_key,
        request_id,
        mode = %mode,
        message_type,
        "chat turn started"
    );

    // Subscribe before the kickoff so the first worker event is never
    // missed; the group is created at the stream head.
    let egress = session_egress_stream(&session_key);
    state.bus.ensure_group(&egress, ORCHESTRATOR_GROUP).await?;

    publish_kickoff(
        &state,
        &request,
        &mode,
        &session_key,
        &request_id,
        is_new_session,
    )
    .await?;

    let consumer = format!("orchestrator_{request_id}");
    let timeout = Duration::from_secs(state.config.server.request_timeout_seconds);
    let block = Duration::from_millis(state.config.bus.stream_block_ms);
    let frames = relay(
        state.bus.clone(),
        Some(state.store.clone()),
        session_id,
        consumer,
        timeout,
        block,
    );

    let events = futures::StreamExt::map(frames, |frame| {
        Ok::<_, Infallible>(Event::default().event(frame.event).data(frame.data))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Publish the turn's first ingress message.
async fn publish_kickoff(
    state: &AppState,
    request: &ChatRequest,
    mode: &str,
    session_key: &str,
    request_id: &str,
    is_new_session: bool,
) -> Result<(), ServerError> {
    if mode != MODE_AGENT {
        let envelope = Envelope::to_agent(names::FREETALKER, session_key, request_id);
        state
            .bus
            .publish_ingress(
                &envelope,
                &Ingress::FreepassRequest {
                    question: request.message.clone(),
                    conversation_history: request.conversation_history.clone(),
                    message_id: None,
                },
            )
            .await?;
        let _ = state
            .store
            .advance_stage(uuid_of(session_key), Stage::Answering)
            .await;
        return Ok(());
    }

    if request.message_type.as_deref() == Some("clarification_response") {
        let envelope = Envelope::to_agent(names::IMPROVEMENT, session_key, request_id);
        state
            .bus
            .publish_ingress(
                &envelope,
                &Ingress::UserClarificationResponse {
                    clarification_answer: request.message.clone(),
                    question_index: request.question_index.unwrap_or(1),
                    total_questions: request.total_questions.unwrap_or(1),
                },
            )
            .await?;
        let _ = state
            .store
            .advance_stage(uuid_of(session_key), Stage::Clarifying)
            .await;
        return Ok(());
    }

    let envelope = Envelope::to_agent(names::CLASSIFIER, session_key, request_id);
    state
        .bus
        .publish_ingress(
            &envelope,
            &Ingress::ClassifyQuestion {
                question: request.message.clone(),
                context: context_from_history(request.conversation_history.as_deref()),
                is_new_question: Some(is_new_session),
            },
        )
        .await?;
    let _ = state
        .store
        .advance_stage(uuid_of(session_key), Stage::Classifying)
        .await;
    Ok(())
}

fn uuid_of(key: &str) -> Uuid {
    Uuid::parse_str(key).unwrap_or(Uuid::nil())
}

/// Prior dialog rendered for the classifier's `{context}` slot.
fn context_from_history(history: Option<&[HistoryMessage]>) -> Option<String> {
    let history = history?;
    if history.is_empty() {
        return None;
    }
    let text = history
        .iter()
        .map(|m| {
            let speaker = if m.role == "user" { "사용자" } else { "AI" };
            format!("{speaker}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n");
    Some(text)
}

/// What to do with one egress entry.
#[derive(Debug, PartialEq, Eq)]
enum FrameKind {
    Forward { terminal: bool },
    Drop,
}

/// Decide forwarding and terminality from the decoded entry.
///
/// Unknown `type` values are dropped with a log, never forwarded to the
/// client.  `answer_complete` is accepted as a legacy alias of
/// `streaming_complete`; `error` frames (orchestrator-injected) always
/// terminate.
fn classify_entry(object: &Map<String, Value>) -> FrameKind {
    let kind = object.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if kind == "answer_complete" || kind == "error" {
        return FrameKind::Forward { terminal: true };
    }
    match serde_json::from_value::<Egress>(Value::Object(object.clone())) {
        // Informational stage logs stay server-side.
        Ok(Egress::ProcessingLog { .. }) => FrameKind::Drop,
        Ok(egress) => FrameKind::Forward {
            terminal: egress.is_turn_terminal(),
        },
        Err(_) => FrameKind::Drop,
    }
}

fn error_frame(session_id: Uuid, message: &str) -> SseFrame {
    let data = serde_json::json!({
        "type": "error",
        "message": message,
        "session_id": session_id.to_string(),
    });
    SseFrame {
        event: "error".into(),
        data: data.to_string(),
    }
}

/// Relay the session egress stream as SSE frames until a terminal event
/// or the deadline.  Frames are emitted strictly in stream-append order;
/// no reordering, no batching.
pub fn relay(
    bus: Arc<dyn Bus>,
    store: Option<Store>,
    session_id: Uuid,
    consumer: String,
    timeout: Duration,
    block: Duration,
) -> impl Stream<Item = SseFrame> {
    stream! {
        let stream_name = session_egress_stream(&session_id.to_string());
        let deadline = Instant::now() + timeout;
        let mut answering = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(session_id = %session_id, "chat turn timed out");
                yield error_frame(session_id, "요청 시간이 초과되었습니다");
                return;
            }

            let entries = match bus
                .read_group(
                    &stream_name,
                    ORCHESTRATOR_GROUP,
                    &consumer,
                    16,
                    remaining.min(block),
                )
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(session_id = %session_id, "egress read failed: {e}");
                    yield error_frame(session_id, "메시지 버스 오류가 발생했습니다");
                    return;
                }
            };

            let mut batch = entries.into_iter();
            while let Some(entry) = batch.next() {
                let object = wire::decode_object(&entry.fields);
                if let Err(e) = bus.ack(&stream_name, ORCHESTRATOR_GROUP, &entry.id).await {
                    warn!(session_id = %session_id, id = %entry.id, "egress ack failed: {e}");
                }

                match classify_entry(&object) {
                    FrameKind::Drop => {
                        debug!(
                            session_id = %session_id,
                            kind = object.get("type").and_then(|v| v.as_str()).unwrap_or("?"),
                            "egress entry filtered from client"
                        );
                        continue;
                    }
                    FrameKind::Forward { terminal } => {
                        if let Some(store) = &store {
                            record_side_effects(store, session_id, &object, &mut answering).await;
                        }
                        let kind = object
                            .get("type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("message")
                            .to_string();
                        let data = Value::Object(object).to_string();
                        yield SseFrame { event: kind, data };

                        if terminal {
                            // Ack whatever else this batch delivered (e.g. a
                            // duplicate terminal) so nothing stays pending.
                            for rest in batch.by_ref() {
                                let _ = bus.ack(&stream_name, ORCHESTRATOR_GROUP, &rest.id).await;
                            }
                            drain_residual(&bus, &stream_name, &consumer).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Stage transitions and transcript writes driven by relayed events.
/// Failures are logged, never surfaced — the relay's job is delivery.
async fn record_side_effects(
    store: &Store,
    session_id: Uuid,
    object: &Map<String, Value>,
    answering: &mut bool,
) {
    let kind = object.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let text = |key: &str| {
        object
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    let result = match kind {
        "clarification_question" => {
            let question = text("question");
            let _ = store
                .append_message(
                    session_id,
                    Sender::Maice,
                    &question,
                    "clarification_question",
                    None,
                )
                .await;
            store.advance_stage(session_id, Stage::Clarifying).await
        }
        "answer_chunk" | "freepass_chunk" if !*answering => {
            *answering = true;
            store.advance_stage(session_id, Stage::Answering).await
        }
        "streaming_complete" => {
            let full = text("full_response");
            let _ = store
                .append_message(session_id, Sender::Maice, &full, "answer", None)
                .await;
            store.advance_stage(session_id, Stage::Answered).await
        }
        _ => return,
    };
    if let Err(e) = result {
        warn!(session_id = %session_id, kind, "session update failed: {e}");
    }
}

/// After a terminal event, duplicates of it may already sit in the
/// stream (at-least-once redelivery).  Consume and ack them so pending
/// entries never accumulate for dead consumers.
async fn drain_residual(bus: &Arc<dyn Bus>, stream_name: &str, consumer: &str) {
    for _ in 0..4 {
        let entries = match bus
            .read_group(
                stream_name,
                ORCHESTRATOR_GROUP,
                consumer,
                16,
                Duration::from_millis(20),
            )
            .await
        {
            Ok(entries) if !entries.is_empty() => entries,
            _ => return,
        };
        for entry in entries {
            let _ = bus.ack(stream_name, ORCHESTRATOR_GROUP, &entry.id).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
