use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::StreamExt;
use shared_types::{Envelope, Payload};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{first_frame, pump_envelopes, reject, HandshakeError};
use crate::{relay::RouteOutcome, AppState};

/// GET /ws/worker
pub async fn worker_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_worker_socket(socket, state))
}

async fn handle_worker_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let handshake = first_frame(&mut socket, state.config.handshake_timeout)
        .await
        .and_then(|frame| check_worker_auth(&frame, state.config.worker_secret.as_deref()));

    if let Err(e) = handshake {
        warn!(error = %e, "worker handshake rejected");
        reject(socket, &e).await;
        return;
    }

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(pump_envelopes(sink, rx));
    let conn_id = state.relay.attach_worker(tx).await;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => relay_worker_frame(&state, text.as_str()),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.relay.detach_worker(conn_id).await;
    writer.abort();
    info!(conn_id, "worker connection closed");
}

/// Validate the `auth` handshake frame against the configured secret.
pub(crate) fn check_worker_auth(frame: &str, expected: Option<&str>) -> Result<(), HandshakeError> {
    let envelope =
        Envelope::decode(frame).map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    let Payload::Auth { secret } = envelope.payload else {
        return Err(HandshakeError::Malformed(format!(
            "expected auth, got {}",
            envelope.kind()
        )));
    };

    match expected {
        Some(expected) if expected == secret => Ok(()),
        Some(_) => Err(HandshakeError::BadSecret),
        None => {
            warn!("WORKER_SECRET is not set; accepting worker without verification");
            Ok(())
        }
    }
}

fn relay_worker_frame(state: &AppState, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "undecodable frame from worker dropped");
            return;
        }
    };

    if !envelope.payload.is_worker_originated() {
        warn!(kind = envelope.kind(), "unexpected message kind from worker dropped");
        return;
    }

    match state.relay.route_to_session(envelope) {
        RouteOutcome::Delivered | RouteOutcome::Dropped => {}
        outcome => debug!(?outcome, "worker message not delivered"),
    }
}
