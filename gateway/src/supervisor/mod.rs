//! Connection supervisor: handshakes for the two WebSocket endpoints.
//!
//! Each accepted socket is authenticated before it is registered anywhere.
//! Once promoted, the socket is split: a writer task drains the connection's
//! outbound channel into the sink while the read loop dispatches frames
//! through the relay.

mod session;
mod worker;

pub use session::{session_websocket, SessionQuery};
pub use worker::worker_websocket;

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt};
use shared_types::Envelope;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Invalid worker secret")]
    BadSecret,

    #[error("Handshake timed out")]
    Timeout,

    #[error("Malformed handshake: {0}")]
    Malformed(String),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Connection closed during handshake")]
    Closed,
}

/// Wait for the first text frame, bounded by `timeout`.
async fn first_frame(socket: &mut WebSocket, timeout: Duration) -> Result<String, HandshakeError> {
    let next = async {
        while let Some(msg) = socket.recv().await {
            match msg {
                Ok(Message::Text(text)) => return Ok(text.to_string()),
                Ok(Message::Close(_)) | Err(_) => return Err(HandshakeError::Closed),
                Ok(_) => continue,
            }
        }
        Err(HandshakeError::Closed)
    };

    tokio::time::timeout(timeout, next)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Refuse a connection with the policy-violation close code.
async fn reject(mut socket: WebSocket, err: &HandshakeError) {
    if matches!(err, HandshakeError::Closed) {
        return;
    }
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: err.to_string().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not delivered");
    }
}

/// Writer half of a promoted connection. Ends when the channel closes or the
/// socket stops accepting frames.
async fn pump_envelopes(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(kind = envelope.kind(), error = %e, "failed to encode envelope");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
