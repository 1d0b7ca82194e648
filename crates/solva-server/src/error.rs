// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use solva_bus::BusError;
use solva_store::StoreError;

/// Edge-level failures.  Validation and authorization problems never
/// enter the bus; they are rejected before the SSE stream opens.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("로그인이 필요합니다")]
    Unauthorized,

    #[error("세션을 찾을 수 없습니다")]
    SessionNotFound,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionNotFound(_) => ServerError::SessionNotFound,
            other => ServerError::Store(other),
        }
    }
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::SessionNotFound => StatusCode::NOT_FOUND,
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::Store(_) | ServerError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        let body = Json(serde_json::json!({
            "type": "error",
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
