//! HTTP upload path: one multipart file relayed to the worker as
//! `upload_start`, a run of `upload_chunk` fragments and `upload_end`.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use shared_types::{fragment, Envelope, Payload};
use tracing::{info, warn};

use crate::{
    auth::{bearer_token, resolve_identity},
    relay::{RouteOutcome, WORKER_UNAVAILABLE},
    supervisor::SessionQuery,
    AppState,
};

#[derive(Debug, Serialize)]
pub struct UploadAccepted {
    pub filename: String,
    pub bytes: usize,
    pub fragments: usize,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// POST /upload
pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let token = bearer_token(&headers).or(query.token.as_deref());
    let identity = match resolve_identity(state.auth.as_ref(), token, query.user_id.as_deref()) {
        Ok(identity) => identity,
        Err(e) => return error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    };
    let user_id = identity.user_id().to_string();

    let (filename, bytes) = loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return error_response(StatusCode::BAD_REQUEST, "missing file part"),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
        };
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        match field.bytes().await {
            Ok(bytes) => break (filename, bytes),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
        }
    };

    if !state.relay.worker_connected().await {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, WORKER_UNAVAILABLE);
    }

    let fragments = fragment(&bytes, state.config.upload_fragment_bytes);
    let fragment_count = fragments.len();

    let messages = std::iter::once(Payload::UploadStart {
        filename: filename.clone(),
    })
    .chain(fragments.into_iter().map(|data| Payload::UploadChunk { data }))
    .chain(std::iter::once(Payload::UploadEnd));

    let batch: Vec<Envelope> = messages
        .map(|payload| Envelope::new(payload).to_user(&user_id))
        .collect();
    if let RouteOutcome::WorkerUnavailable { .. } = state.relay.route_batch_to_worker(batch).await {
        warn!(user_id = %user_id, filename = %filename, "worker went away mid-upload");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, WORKER_UNAVAILABLE);
    }

    info!(
        user_id = %user_id,
        filename = %filename,
        bytes = bytes.len(),
        fragments = fragment_count,
        "upload relayed to worker"
    );

    (
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            filename,
            bytes: bytes.len(),
            fragments: fragment_count,
        }),
    )
        .into_response()
}
