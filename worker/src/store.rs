//! DocumentStoreActor - per-identity passage sets, bounded LRU.
//!
//! Each identity owns at most one [`PassageSet`]; an upload replaces it
//! wholesale. The cache holds at most `capacity` identities and evicts the
//! least recently used one (reads count as use).
//!
//! Every put carries the upload's generation, stamped when `upload_end` was
//! read off the link. A put older than the stored generation is refused, so
//! a slow ingest can never overwrite a later upload that finished first.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = DocumentStore::spawn(64).await?;
//! store.put("alice", Arc::new(set), generation).await?;
//! let set = store.get("alice").await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};

use crate::pipeline::PassageSet;

#[derive(Debug)]
struct CacheEntry {
    last_used: u64,
    generation: u64,
    set: Arc<PassageSet>,
}

/// Result of offering a passage set to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored; names the identity evicted to make room, if any.
    Stored { evicted: Option<String> },
    /// Refused: the identity already holds a set from a later upload.
    Superseded { current: u64 },
}

/// Recency-ordered map; `tick` is a logical clock bumped on every touch.
#[derive(Debug)]
pub struct SessionCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, CacheEntry>,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Insert or replace unless a later generation is already stored.
    pub fn put(&mut self, user_id: &str, set: Arc<PassageSet>, generation: u64) -> PutOutcome {
        if let Some(existing) = self.entries.get(user_id) {
            if existing.generation > generation {
                return PutOutcome::Superseded {
                    current: existing.generation,
                };
            }
        }

        let last_used = self.next_tick();
        let replaced = self
            .entries
            .insert(
                user_id.to_string(),
                CacheEntry {
                    last_used,
                    generation,
                    set,
                },
            )
            .is_some();
        if replaced || self.entries.len() <= self.capacity {
            return PutOutcome::Stored { evicted: None };
        }

        let evicted = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = &evicted {
            self.entries.remove(id);
        }
        PutOutcome::Stored { evicted }
    }

    pub fn get(&mut self, user_id: &str) -> Option<Arc<PassageSet>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(user_id)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.set))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DocumentStoreActor;

#[derive(Debug)]
pub enum DocumentStoreMsg {
    /// Replace the identity's passage set if `generation` is not stale
    Put {
        user_id: String,
        set: Arc<PassageSet>,
        generation: u64,
        reply: RpcReplyPort<PutOutcome>,
    },
    Get {
        user_id: String,
        reply: RpcReplyPort<Option<Arc<PassageSet>>>,
    },
    Len {
        reply: RpcReplyPort<usize>,
    },
}

#[async_trait]
impl Actor for DocumentStoreActor {
    type Msg = DocumentStoreMsg;
    type State = SessionCache;
    type Arguments = usize;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        capacity: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            capacity,
            "DocumentStoreActor starting"
        );
        Ok(SessionCache::new(capacity))
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DocumentStoreMsg::Put {
                user_id,
                set,
                generation,
                reply,
            } => {
                let passages = set.len();
                let ingested_at = set.ingested_at();
                let outcome = state.put(&user_id, set, generation);
                match &outcome {
                    PutOutcome::Stored {
                        evicted: Some(evicted),
                    } => tracing::info!(
                        evicted = %evicted,
                        inserted = %user_id,
                        "session cache full, evicted least recently used identity"
                    ),
                    PutOutcome::Stored { evicted: None } => {
                        tracing::debug!(
                            user_id = %user_id,
                            passages,
                            generation,
                            %ingested_at,
                            "passage set stored"
                        )
                    }
                    PutOutcome::Superseded { current } => tracing::info!(
                        user_id = %user_id,
                        generation,
                        current,
                        %ingested_at,
                        "stale passage set refused"
                    ),
                }
                let _ = reply.send(outcome);
            }
            DocumentStoreMsg::Get { user_id, reply } => {
                let _ = reply.send(state.get(&user_id));
            }
            DocumentStoreMsg::Len { reply } => {
                let _ = reply.send(state.len());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Document store unavailable: {0}")]
    Unavailable(String),
}

impl From<ractor::RactorErr<DocumentStoreMsg>> for StoreError {
    fn from(e: ractor::RactorErr<DocumentStoreMsg>) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<ractor::SpawnErr> for StoreError {
    fn from(e: ractor::SpawnErr) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Cloneable handle around the actor.
#[derive(Clone)]
pub struct DocumentStore {
    actor: ActorRef<DocumentStoreMsg>,
}

impl DocumentStore {
    pub async fn spawn(capacity: usize) -> Result<Self, StoreError> {
        let (actor, _handle) = Actor::spawn(None, DocumentStoreActor, capacity).await?;
        Ok(Self { actor })
    }

    pub async fn put(
        &self,
        user_id: impl Into<String>,
        set: Arc<PassageSet>,
        generation: u64,
    ) -> Result<PutOutcome, StoreError> {
        Ok(ractor::call!(self.actor, |reply| DocumentStoreMsg::Put {
            user_id: user_id.into(),
            set,
            generation,
            reply,
        })?)
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<Arc<PassageSet>>, StoreError> {
        Ok(ractor::call!(self.actor, |reply| DocumentStoreMsg::Get {
            user_id: user_id.to_string(),
            reply,
        })?)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(ractor::call!(self.actor, |reply| DocumentStoreMsg::Len {
            reply
        })?)
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}
