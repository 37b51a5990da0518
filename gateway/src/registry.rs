use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use shared_types::Envelope;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Outbound half of a connection: envelopes queued here are written to the
/// socket by that connection's writer task, in order.
pub type Outbound = mpsc::UnboundedSender<Envelope>;

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub conn_id: u64,
    pub tx: Outbound,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Session identifier → open outbound channel.
///
/// At most one channel per identifier; a later registration replaces the
/// earlier one.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    next_conn_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tx` as the channel for `id`, replacing any existing one.
    pub fn register(&self, id: &str, tx: Outbound) -> SessionHandle {
        let handle = SessionHandle {
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            tx,
            connected_at: Utc::now(),
        };
        if let Some(previous) = self.sessions.insert(id.to_string(), handle.clone()) {
            info!(
                user_id = %id,
                replaced_conn = previous.conn_id,
                conn_id = handle.conn_id,
                "session re-registered; newest connection wins"
            );
        } else {
            debug!(user_id = %id, conn_id = handle.conn_id, "session registered");
        }
        handle
    }

    /// Remove `id` regardless of which connection owns it.
    pub fn deregister(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Remove `id` only if it still belongs to `conn_id`, so a replaced
    /// connection closing late does not evict its successor.
    pub fn release(&self, id: &str, conn_id: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, handle| handle.conn_id == conn_id)
            .is_some();
        if removed {
            debug!(user_id = %id, conn_id, "session deregistered");
        }
        removed
    }

    pub fn lookup(&self, id: &str) -> Option<Outbound> {
        self.sessions.get(id).map(|entry| entry.tx.clone())
    }

    /// Queue `envelope` for `id`. Returns false when the session is absent or
    /// its connection has already gone away.
    pub fn send(&self, id: &str, envelope: Envelope) -> bool {
        match self.lookup(id) {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Queue one envelope per registered session, built by `make`.
    pub fn broadcast(&self, make: impl Fn(&str) -> Envelope) -> usize {
        let targets: Vec<(String, Outbound)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.tx.clone()))
            .collect();

        targets
            .into_iter()
            .filter(|(id, tx)| tx.send(make(id)).is_ok())
            .count()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|e| SessionSnapshot {
                user_id: e.key().clone(),
                connected_at: e.connected_at,
            })
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
