// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session endpoints: the persistence surface the chat UI consumes.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use solva_store::MessageRecord;

use crate::chat::user_id_from_headers;
use crate::error::ServerError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

fn message_json(m: &MessageRecord) -> Value {
    json!({
        "id": m.id,
        "content": m.content,
        "sender": m.sender.as_str(),
        "message_type": m.message_type,
        "timestamp": m.created_at.to_rfc3339(),
    })
}

pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ServerError> {
    let user_id = user_id_from_headers(&headers)?;
    let sessions = state.store.list_sessions(&user_id).await?;
    let items: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "session_id": s.session_id,
                "title": s.title,
                "stage": s.stage.as_str(),
                "updated_at": s.updated_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(json!({
        "type": "session_list",
        "sessions": items,
        "total_count": items.len(),
    })))
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ServerError> {
    let user_id = user_id_from_headers(&headers)?;
    let session = state
        .store
        .create_session(&user_id, request.title.as_deref())
        .await?;
    Ok(Json(json!({
        "type": "session_created",
        "session_id": session.session_id,
    })))
}

pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ServerError> {
    let user_id = user_id_from_headers(&headers)?;
    let session = state.store.get_session(session_id).await?;
    if session.user_id != user_id {
        return Err(ServerError::Unauthorized);
    }
    let history = state.store.session_history(session_id).await?;
    let summary = state.store.summary(session_id).await?;
    Ok(Json(json!({
        "type": "session_info",
        "session": {
            "session_id": session.session_id,
            "title": session.title,
            "stage": session.stage.as_str(),
            "is_active": session.is_active,
            "updated_at": session.updated_at.to_rfc3339(),
        },
        "conversation_history": history.iter().map(message_json).collect::<Vec<_>>(),
        "summary": summary.map(|s| json!({
            "conversation_summary": s.conversation_summary,
            "student_status": s.student_status,
        })),
    })))
}

pub async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ServerError> {
    let user_id = user_id_from_headers(&headers)?;
    let session = state.store.get_session(session_id).await?;
    if session.user_id != user_id {
        return Err(ServerError::Unauthorized);
    }
    let history = state.store.session_history(session_id).await?;
    Ok(Json(json!({
        "type": "session_history",
        "history": history.iter().map(message_json).collect::<Vec<_>>(),
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ServerError> {
    let user_id = user_id_from_headers(&headers)?;
    let deleted = state.store.deactivate_session(session_id, &user_id).await?;
    if !deleted {
        return Err(ServerError::SessionNotFound);
    }
    Ok(Json(json!({ "type": "session_deleted" })))
}
