//! Relay dispatcher: the single worker slot plus the session registry.
//!
//! Session → worker traffic is forwarded verbatim when a worker is attached,
//! otherwise the originating session gets one `error` envelope. Worker →
//! session traffic is delivered to whichever session the envelope's
//! `user_id` names, or dropped. Nothing here is retried or buffered.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared_types::Envelope;
use tokio::sync::{mpsc::error::SendError, RwLock};
use tracing::{debug, info, warn};

use crate::registry::{Outbound, SessionRegistry, SessionSnapshot};

pub const WORKER_UNAVAILABLE: &str = "Local AI worker is not connected.";
pub const WORKER_READY: &str = "AI worker connected. Ready to upload.";
pub const WORKER_WAITING: &str = "Waiting for local AI worker to connect...";
pub const WORKER_LOST: &str = "AI worker disconnected.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// No live worker. `notified` tells whether the origin got an error envelope.
    WorkerUnavailable { notified: bool },
    /// The addressed session is not registered (or its connection closed).
    SessionGone,
    /// Not routable (ping, or no destination).
    Dropped,
}

struct WorkerHandle {
    conn_id: u64,
    tx: Outbound,
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub worker_connected: bool,
    pub worker_connected_at: Option<DateTime<Utc>>,
    pub sessions: Vec<String>,
    pub session_details: Vec<SessionSnapshot>,
}

#[derive(Default)]
pub struct Relay {
    sessions: SessionRegistry,
    worker: RwLock<Option<WorkerHandle>>,
    next_worker_conn: AtomicU64,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Install `tx` as the sole worker connection, replacing any previous one.
    pub async fn attach_worker(&self, tx: Outbound) -> u64 {
        let conn_id = self.next_worker_conn.fetch_add(1, Ordering::Relaxed);
        let previous = self.worker.write().await.replace(WorkerHandle {
            conn_id,
            tx,
            connected_at: Utc::now(),
        });
        match previous {
            Some(old) => warn!(
                replaced_conn = old.conn_id,
                conn_id, "second worker connected; replacing previous worker connection"
            ),
            None => info!(conn_id, "worker attached"),
        }

        let notified = self
            .sessions
            .broadcast(|id| Envelope::status(id, WORKER_READY));
        debug!(notified, "announced worker availability");
        conn_id
    }

    /// Clear the worker slot if it still holds `conn_id`.
    pub async fn detach_worker(&self, conn_id: u64) -> bool {
        let detached = {
            let mut slot = self.worker.write().await;
            match slot.as_ref() {
                Some(worker) if worker.conn_id == conn_id => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        };

        if detached {
            info!(conn_id, "worker detached");
            self.sessions.broadcast(|id| Envelope::status(id, WORKER_LOST));
        } else {
            debug!(conn_id, "stale worker connection closed; slot untouched");
        }
        detached
    }

    pub async fn worker_connected(&self) -> bool {
        self.worker
            .read()
            .await
            .as_ref()
            .is_some_and(|w| !w.tx.is_closed())
    }

    /// Greeting sent to a session right after it registers.
    pub async fn availability_status(&self, user_id: &str) -> Envelope {
        if self.worker_connected().await {
            Envelope::status(user_id, WORKER_READY)
        } else {
            Envelope::status(user_id, WORKER_WAITING)
        }
    }

    /// Forward a session's envelope to the worker, or tell the session the
    /// worker is absent. Never fails.
    pub async fn route_to_worker(&self, envelope: Envelope) -> RouteOutcome {
        let undelivered = {
            let slot = self.worker.read().await;
            match slot.as_ref() {
                Some(worker) => match worker.tx.send(envelope) {
                    Ok(()) => return RouteOutcome::Delivered,
                    Err(SendError(envelope)) => envelope,
                },
                None => envelope,
            }
        };

        let Some(user_id) = undelivered.user_id.as_deref() else {
            warn!(kind = undelivered.kind(), "no worker and no origin to notify");
            return RouteOutcome::WorkerUnavailable { notified: false };
        };

        let error = Envelope::error(user_id, WORKER_UNAVAILABLE)
            .with_request(undelivered.request_id.clone());
        let notified = self.sessions.send(user_id, error);
        debug!(
            user_id,
            kind = undelivered.kind(),
            notified,
            "worker unavailable"
        );
        RouteOutcome::WorkerUnavailable { notified }
    }

    /// Forward `envelopes` to the worker as one contiguous run.
    ///
    /// The slot's write guard is held for the whole batch so no other
    /// producer can splice frames between them. The caller reports failure;
    /// no session is notified.
    pub async fn route_batch_to_worker(&self, envelopes: Vec<Envelope>) -> RouteOutcome {
        let slot = self.worker.write().await;
        let Some(worker) = slot.as_ref() else {
            return RouteOutcome::WorkerUnavailable { notified: false };
        };
        let total = envelopes.len();
        for (sent, envelope) in envelopes.into_iter().enumerate() {
            if worker.tx.send(envelope).is_err() {
                warn!(sent, total, "worker channel closed mid-batch");
                return RouteOutcome::WorkerUnavailable { notified: false };
            }
        }
        RouteOutcome::Delivered
    }

    /// Deliver a worker envelope to the session it names.
    pub fn route_to_session(&self, envelope: Envelope) -> RouteOutcome {
        if envelope.is_ping() {
            return RouteOutcome::Dropped;
        }

        let Some(user_id) = envelope.user_id.clone() else {
            warn!(kind = envelope.kind(), "worker message without user_id dropped");
            return RouteOutcome::Dropped;
        };

        let kind = envelope.kind();
        if self.sessions.send(&user_id, envelope) {
            RouteOutcome::Delivered
        } else {
            debug!(user_id = %user_id, kind, "destination session gone; dropping");
            RouteOutcome::SessionGone
        }
    }

    pub async fn snapshot(&self) -> RelaySnapshot {
        let (worker_connected, worker_connected_at) = match self.worker.read().await.as_ref() {
            Some(w) if !w.tx.is_closed() => (true, Some(w.connected_at)),
            _ => (false, None),
        };
        RelaySnapshot {
            worker_connected,
            worker_connected_at,
            sessions: self.sessions.ids(),
            session_details: self.sessions.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::Payload;
    use tokio::sync::mpsc;

    fn ask(user: &str, text: &str) -> Envelope {
        Envelope::new(Payload::Ask { data: text.into() }).to_user(user)
    }

    #[tokio::test]
    async fn test_no_worker_notifies_origin_once_per_message() {
        let relay = Relay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.sessions().register("bob", tx);

        for _ in 0..3 {
            let outcome = relay.route_to_worker(ask("bob", "what is X")).await;
            assert_eq!(outcome, RouteOutcome::WorkerUnavailable { notified: true });
        }

        for _ in 0..3 {
            let env = rx.try_recv().unwrap();
            assert_eq!(
                env.payload,
                Payload::Error {
                    data: WORKER_UNAVAILABLE.into()
                }
            );
            assert_eq!(env.user_id.as_deref(), Some("bob"));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_worker_and_origin_gone_is_absorbed() {
        let relay = Relay::new();
        let outcome = relay.route_to_worker(ask("ghost", "hello")).await;
        assert_eq!(outcome, RouteOutcome::WorkerUnavailable { notified: false });
    }

    #[tokio::test]
    async fn test_error_keeps_request_id() {
        let relay = Relay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.sessions().register("bob", tx);

        relay
            .route_to_worker(ask("bob", "q").with_request(Some("req-1".into())))
            .await;
        assert_eq!(rx.try_recv().unwrap().request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_forward_to_worker_preserves_order() {
        let relay = Relay::new();
        let (wtx, mut wrx) = mpsc::unbounded_channel();
        relay.attach_worker(wtx).await;

        for i in 0..5 {
            let outcome = relay.route_to_worker(ask("alice", &format!("q{i}"))).await;
            assert_eq!(outcome, RouteOutcome::Delivered);
        }
        for i in 0..5 {
            assert_eq!(
                wrx.try_recv().unwrap().payload,
                Payload::Ask {
                    data: format!("q{i}")
                }
            );
        }
    }

    fn upload_batch(user: &str, filename: &str, chunks: usize) -> Vec<Envelope> {
        std::iter::once(Payload::UploadStart {
            filename: filename.into(),
        })
        .chain((0..chunks).map(|i| Payload::UploadChunk {
            data: format!("{filename}-{i}"),
        }))
        .chain(std::iter::once(Payload::UploadEnd))
        .map(|p| Envelope::new(p).to_user(user))
        .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_batches_are_not_interleaved() {
        let relay = std::sync::Arc::new(Relay::new());
        let (wtx, mut wrx) = mpsc::unbounded_channel();
        relay.attach_worker(wtx).await;

        let tasks: Vec<_> = ["a.pdf", "b.pdf", "c.pdf", "d.pdf"]
            .into_iter()
            .map(|name| {
                let relay = std::sync::Arc::clone(&relay);
                tokio::spawn(async move {
                    relay
                        .route_batch_to_worker(upload_batch("alice", name, 200))
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), RouteOutcome::Delivered);
        }

        let mut current: Option<String> = None;
        let mut finished = 0;
        while let Ok(env) = wrx.try_recv() {
            match env.payload {
                Payload::UploadStart { filename } => {
                    assert!(current.is_none(), "start inside another upload");
                    current = Some(filename);
                }
                Payload::UploadChunk { data } => {
                    let open = current.as_deref().expect("chunk outside an upload");
                    assert!(data.starts_with(open), "{data} spliced into {open}");
                }
                Payload::UploadEnd => {
                    assert!(current.take().is_some());
                    finished += 1;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(finished, 4);
    }

    #[tokio::test]
    async fn test_batch_without_worker_notifies_nobody() {
        let relay = Relay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.sessions().register("bob", tx);

        let outcome = relay
            .route_batch_to_worker(upload_batch("bob", "x.pdf", 2))
            .await;
        assert_eq!(outcome, RouteOutcome::WorkerUnavailable { notified: false });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_worker_channel_counts_as_absent() {
        let relay = Relay::new();
        let (wtx, wrx) = mpsc::unbounded_channel();
        relay.attach_worker(wtx).await;
        drop(wrx);

        assert!(!relay.worker_connected().await);
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.sessions().register("bob", tx);
        let outcome = relay.route_to_worker(ask("bob", "q")).await;
        assert_eq!(outcome, RouteOutcome::WorkerUnavailable { notified: true });
        assert_eq!(rx.try_recv().unwrap().kind(), "error");
    }

    #[tokio::test]
    async fn test_route_to_session_addresses_only_destination() {
        let relay = Relay::new();
        let (carol_tx, mut carol_rx) = mpsc::unbounded_channel();
        let (dave_tx, mut dave_rx) = mpsc::unbounded_channel();
        relay.sessions().register("carol", carol_tx);
        relay.sessions().register("dave", dave_tx);

        let stream = vec![
            Envelope::answer_chunk("carol", "a"),
            Envelope::answer_chunk("carol", "b"),
            Envelope::answer_chunk("carol", "c"),
            Envelope::answer_end("carol"),
        ];
        for env in stream.clone() {
            assert_eq!(relay.route_to_session(env), RouteOutcome::Delivered);
        }

        for expected in stream {
            assert_eq!(carol_rx.try_recv().unwrap(), expected);
        }
        assert!(dave_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_to_session_drops_ping_and_unknown() {
        let relay = Relay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.sessions().register("carol", tx);

        let ping = Envelope::new(Payload::Ping).to_user("carol");
        assert_eq!(relay.route_to_session(ping), RouteOutcome::Dropped);
        assert_eq!(
            relay.route_to_session(Envelope::new(Payload::AnswerEnd)),
            RouteOutcome::Dropped
        );
        assert_eq!(
            relay.route_to_session(Envelope::answer_end("nobody")),
            RouteOutcome::SessionGone
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_worker_replacement_and_stale_detach() {
        let relay = Relay::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let first = relay.attach_worker(tx1).await;
        let second = relay.attach_worker(tx2).await;

        // The first connection closing must not clear the second.
        assert!(!relay.detach_worker(first).await);
        assert!(relay.worker_connected().await);

        relay.route_to_worker(ask("alice", "q")).await;
        assert!(rx2.try_recv().is_ok());

        assert!(relay.detach_worker(second).await);
        assert!(!relay.worker_connected().await);
    }

    #[tokio::test]
    async fn test_worker_lifecycle_is_announced() {
        let relay = Relay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.sessions().register("alice", tx);

        assert_eq!(
            relay.availability_status("alice").await,
            Envelope::status("alice", WORKER_WAITING)
        );

        let (wtx, _wrx) = mpsc::unbounded_channel();
        let conn = relay.attach_worker(wtx).await;
        assert_eq!(rx.try_recv().unwrap(), Envelope::status("alice", WORKER_READY));

        relay.detach_worker(conn).await;
        assert_eq!(rx.try_recv().unwrap(), Envelope::status("alice", WORKER_LOST));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let relay = Relay::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        relay.sessions().register("alice", tx);

        let snap = relay.snapshot().await;
        assert!(!snap.worker_connected);
        assert_eq!(snap.sessions, vec!["alice".to_string()]);

        let (wtx, _wrx) = mpsc::unbounded_channel();
        relay.attach_worker(wtx).await;
        assert!(relay.snapshot().await.worker_connected);
    }
}
