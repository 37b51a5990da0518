//! Outbound WebSocket link to the gateway.
//!
//! The worker dials the gateway, authenticates with the shared secret and
//! then serves frames until the connection drops. `run` redials forever with
//! a fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use shared_types::{Envelope, Payload};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::dispatch::WorkerService;

/// Keep the gateway link up for the life of the process. Every dial failure
/// or disconnect is followed by `backoff` and a fresh dial.
pub async fn run(url: &str, secret: &str, backoff: Duration, service: Arc<WorkerService>) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match connect_once(url, secret, Arc::clone(&service)).await {
            Ok(()) => warn!(url, attempt, "gateway closed the connection"),
            Err(e) => error!(url, attempt, error = %e, "gateway link failed"),
        }
        info!(backoff_ms = backoff.as_millis() as u64, "reconnecting to gateway");
        tokio::time::sleep(backoff).await;
    }
}

/// One connection lifetime: dial, authenticate, serve until closed.
pub async fn connect_once(url: &str, secret: &str, service: Arc<WorkerService>) -> Result<()> {
    let (ws_stream, _) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to gateway at {url}"))?;
    let (mut sink, mut stream) = ws_stream.split();

    let auth = Envelope::new(Payload::Auth {
        secret: secret.to_string(),
    })
    .encode()?;
    sink.send(Message::Text(auth))
        .await
        .context("Failed to send auth handshake")?;
    info!(url, "connected to gateway");

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "failed to encode outbound envelope");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let result = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                service.handle_frame(&text, &tx);
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "gateway sent close");
                break Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break Err(anyhow::Error::new(e).context("gateway link read failed")),
            None => break Ok(()),
        }
    };

    // In-flight tasks hold clones of `tx`; stop writing so the socket drops now.
    writer.abort();
    result
}
