use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::{
    auth::bearer_token,
    supervisor::SessionQuery,
    transcripts::{Transcript, TranscriptMessage},
    AppState,
};

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /status: worker presence and registered sessions
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.relay.snapshot().await;
    Json(json!({
        "worker_connected": snapshot.worker_connected,
        "worker_connected_at": snapshot.worker_connected_at,
        "sessions": snapshot.sessions,
        "session_details": snapshot.session_details,
    }))
}

/// Transcripts belong to authenticated identities only.
fn authenticated_user(
    state: &AppState,
    headers: &HeaderMap,
    query: &SessionQuery,
) -> Result<String, Response> {
    let Some(token) = bearer_token(headers).or(query.token.as_deref()) else {
        return Err((StatusCode::UNAUTHORIZED, "bearer token required").into_response());
    };
    state
        .auth
        .verify(token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()).into_response())
}

/// GET /chats: transcript summaries, newest first
pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let user_id = match authenticated_user(&state, &headers, &query) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    match state.transcripts.list(&user_id).await {
        Ok(chats) => Json(chats).into_response(),
        Err(e) => {
            error!(user_id = %user_id, error = %e, "list transcripts");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /chats/{chat_id}
pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let user_id = match authenticated_user(&state, &headers, &query) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    match state.transcripts.load(&user_id, &chat_id).await {
        Ok(Some(transcript)) => Json(transcript).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "chat not found").into_response(),
        Err(e) => {
            error!(user_id = %user_id, chat_id = %chat_id, error = %e, "load transcript");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SaveChatRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub messages: Vec<TranscriptMessage>,
}

/// PUT /chats/{chat_id}
pub async fn put_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    Json(body): Json<SaveChatRequest>,
) -> Response {
    let user_id = match authenticated_user(&state, &headers, &query) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    if chat_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "chat_id must not be empty").into_response();
    }

    let transcript = Transcript {
        chat_id,
        title: body.title,
        messages: body.messages,
        updated_at: Utc::now(),
    };
    match state.transcripts.save(&user_id, &transcript).await {
        Ok(()) => Json(transcript).into_response(),
        Err(e) => {
            error!(user_id = %user_id, chat_id = %transcript.chat_id, error = %e, "save transcript");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
