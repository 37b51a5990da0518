use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::StreamExt;
use serde::Deserialize;
use shared_types::Envelope;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::{first_frame, pump_envelopes, reject, HandshakeError};
use crate::{
    auth::{resolve_identity, Identity},
    registry::Outbound,
    relay::RouteOutcome,
    AppState,
};

/// Query parameters accepted on the session endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub token: Option<String>,
    pub user_id: Option<String>,
}

impl SessionQuery {
    fn is_empty(&self) -> bool {
        self.token.is_none() && self.user_id.is_none()
    }
}

/// GET /ws/session (and /ws/web)
pub async fn session_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session_socket(socket, state, query))
}

/// Identity hints from a first frame, plus the frame itself when it also
/// carries a relay message that must not be lost.
#[derive(Debug)]
struct Hello {
    query: SessionQuery,
    pending: Option<String>,
}

fn parse_hello(frame: String) -> Result<Hello, HandshakeError> {
    let value: serde_json::Value =
        serde_json::from_str(&frame).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(HandshakeError::Malformed("expected a JSON object".into()));
    };

    let field = |name: &str| {
        object
            .get(name)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };

    let query = SessionQuery {
        token: field("token"),
        user_id: field("user_id"),
    };
    // `{"type":"auth",...}` is pure handshake; anything else typed is replayed.
    let relayable = match object.get("type") {
        None => false,
        Some(kind) => kind.as_str() != Some("auth"),
    };
    let pending = relayable.then_some(frame);
    Ok(Hello { query, pending })
}

async fn handshake(
    socket: &mut WebSocket,
    state: &AppState,
    query: SessionQuery,
) -> Result<(Identity, Option<String>), HandshakeError> {
    let (query, pending) = if query.is_empty() {
        let hello = parse_hello(first_frame(socket, state.config.handshake_timeout).await?)?;
        (hello.query, hello.pending)
    } else {
        (query, None)
    };

    let identity = resolve_identity(
        state.auth.as_ref(),
        query.token.as_deref(),
        query.user_id.as_deref(),
    )?;
    Ok((identity, pending))
}

async fn handle_session_socket(mut socket: WebSocket, state: Arc<AppState>, query: SessionQuery) {
    let (identity, pending) = match handshake(&mut socket, &state, query).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(error = %e, "session handshake rejected");
            reject(socket, &e).await;
            return;
        }
    };
    let user_id = identity.user_id().to_string();

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(pump_envelopes(sink, rx));

    let handle = state.relay.sessions().register(&user_id, tx.clone());
    info!(user_id = %user_id, guest = identity.is_guest(), conn_id = handle.conn_id, "session connected");

    let _ = tx.send(Envelope::auth_success(&user_id));
    let _ = tx.send(state.relay.availability_status(&user_id).await);

    if let Some(frame) = pending {
        handle_session_frame(&state, &user_id, &tx, &frame).await;
    }

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => handle_session_frame(&state, &user_id, &tx, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.relay.sessions().release(&user_id, handle.conn_id);
    writer.abort();
    info!(user_id = %user_id, conn_id = handle.conn_id, "session disconnected");
}

/// Dispatch one frame from a registered session.
pub(crate) async fn handle_session_frame(
    state: &AppState,
    user_id: &str,
    tx: &Outbound,
    text: &str,
) {
    let mut envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(user_id, error = %e, "undecodable session frame");
            let _ = tx.send(Envelope::error(user_id, e.to_string()));
            return;
        }
    };

    if envelope.is_ping() {
        return;
    }

    if !envelope.payload.is_session_originated() {
        let _ = tx.send(
            Envelope::error(
                user_id,
                format!("Message type '{}' cannot be sent by a session", envelope.kind()),
            )
            .with_request(envelope.request_id),
        );
        return;
    }

    // The origin is always the authenticated connection, never the payload.
    envelope.user_id = Some(user_id.to_string());
    if envelope.payload.opens_request() && envelope.request_id.is_none() {
        envelope.request_id = Some(Ulid::new().to_string());
    }

    let kind = envelope.kind();
    match state.relay.route_to_worker(envelope).await {
        RouteOutcome::Delivered => debug!(user_id, kind, "forwarded to worker"),
        outcome => debug!(user_id, kind, ?outcome, "not forwarded"),
    }
}
