//! Worker-side envelope dispatch.
//!
//! Upload envelopes are sequenced inline by the caller's read loop so that
//! start/chunk/end for one identity are applied in arrival order. Everything
//! slow (extraction, embedding, generation) runs in a spawned task whose
//! replies flow back through the link's outbound channel, tagged with the
//! originating identity and request id.
//!
//! Each `upload_end` is stamped with a generation number as it is read, so
//! ingests that finish out of order cannot replace a later document with an
//! earlier one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared_types::transfer::AppendOutcome;
use shared_types::{Envelope, Payload, Reassembler};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::extract::{DocumentExtractor, ExtractProgress};
use crate::pipeline::{Pipeline, PipelineError, TokenStream};
use crate::providers::GenerationEvent;
use crate::store::{DocumentStore, PutOutcome};

pub type Outbound = mpsc::UnboundedSender<Envelope>;

pub const EMPTY_RESPONSE: &str = "The model did not provide a response.";

/// Addressing for every envelope produced on behalf of one request.
#[derive(Clone)]
struct Reply {
    tx: Outbound,
    user_id: String,
    request_id: Option<String>,
}

impl Reply {
    /// False once the link is gone.
    fn send(&self, payload: Payload) -> bool {
        let envelope = Envelope::new(payload)
            .to_user(self.user_id.as_str())
            .with_request(self.request_id.clone());
        self.tx.send(envelope).is_ok()
    }

    fn status(&self, text: impl Into<String>) -> bool {
        self.send(Payload::Status { data: text.into() })
    }

    fn chunk(&self, token: String) -> bool {
        self.send(Payload::AnswerChunk { data: token })
    }

    fn end(&self) -> bool {
        self.send(Payload::AnswerEnd)
    }

    fn error(&self, text: impl Into<String>) -> bool {
        self.send(Payload::Error { data: text.into() })
    }
}

pub struct WorkerService {
    reassembler: Mutex<Reassembler>,
    upload_generation: AtomicU64,
    extractor: DocumentExtractor,
    pipeline: Pipeline,
    store: DocumentStore,
}

impl WorkerService {
    pub fn new(extractor: DocumentExtractor, pipeline: Pipeline, store: DocumentStore) -> Self {
        Self {
            reassembler: Mutex::new(Reassembler::new()),
            upload_generation: AtomicU64::new(0),
            extractor,
            pipeline,
            store,
        }
    }

    /// Bound reassembly: uploads over `max_bytes` are refused and buffers
    /// idle past `max_age` are dropped.
    pub fn with_upload_limits(mut self, max_bytes: usize, max_age: Duration) -> Self {
        self.reassembler = Mutex::new(Reassembler::with_limits(max_bytes, max_age));
        self
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Handle one text frame from the gateway. Returns the spawned task for
    /// kinds that do their work in the background.
    pub fn handle_frame(self: &Arc<Self>, text: &str, tx: &Outbound) -> Option<JoinHandle<()>> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame from gateway");
                return None;
            }
        };

        let Some(user_id) = envelope.user_id.clone() else {
            warn!(kind = envelope.kind(), "dropping envelope with no user_id");
            return None;
        };
        let reply = Reply {
            tx: tx.clone(),
            user_id,
            request_id: envelope.request_id.clone(),
        };

        match envelope.payload {
            Payload::UploadStart { filename } => {
                info!(user_id = %reply.user_id, filename = %filename, "upload started");
                self.with_reassembler(|r| r.start(&reply.user_id, &filename));
                None
            }
            Payload::UploadChunk { data } => {
                match self.with_reassembler(|r| r.append(&reply.user_id, data))? {
                    Ok(AppendOutcome::Appended { fragments }) => {
                        debug!(user_id = %reply.user_id, fragments, "upload fragment buffered");
                    }
                    Ok(AppendOutcome::NoOpenBuffer) => {}
                    Err(e) => {
                        reply.error(e.to_string());
                    }
                }
                None
            }
            Payload::UploadEnd => {
                let finished = self.with_reassembler(|r| r.finish(&reply.user_id))?;
                match finished {
                    Ok(upload) => {
                        let generation = self.upload_generation.fetch_add(1, Ordering::Relaxed) + 1;
                        let service = Arc::clone(self);
                        Some(tokio::spawn(async move {
                            service
                                .ingest(reply, upload.filename, upload.bytes, generation)
                                .await;
                        }))
                    }
                    Err(e) => {
                        warn!(user_id = %reply.user_id, error = %e, "upload could not be reassembled");
                        reply.error(e.to_string());
                        None
                    }
                }
            }
            Payload::Ask { data } => {
                let service = Arc::clone(self);
                Some(tokio::spawn(async move { service.ask(reply, data).await }))
            }
            Payload::GeneralChat { data } => {
                let service = Arc::clone(self);
                Some(tokio::spawn(async move {
                    service.general_chat(reply, data).await
                }))
            }
            Payload::Ping => None,
            other => {
                debug!(kind = other.kind(), "ignoring envelope kind on worker");
                None
            }
        }
    }

    fn with_reassembler<T>(&self, f: impl FnOnce(&mut Reassembler) -> T) -> Option<T> {
        match self.reassembler.lock() {
            Ok(mut guard) => Some(f(&mut guard)),
            Err(_) => {
                error!("upload reassembler lock poisoned");
                None
            }
        }
    }

    async fn ingest(&self, reply: Reply, filename: String, bytes: Vec<u8>, generation: u64) {
        reply.status(format!("Processing '{filename}'..."));

        let progress = |p: ExtractProgress| {
            reply.status(p.message());
        };
        let text = match self.extractor.extract(&filename, &bytes, &progress).await {
            Ok(text) => text,
            Err(e) => {
                warn!(user_id = %reply.user_id, filename = %filename, error = %e, "extraction failed");
                reply.error(PipelineError::from(e).to_string());
                return;
            }
        };

        let set = match self.pipeline.ingest(&filename, &text).await {
            Ok(set) => set,
            Err(e) => {
                warn!(user_id = %reply.user_id, filename = %filename, error = %e, "ingestion failed");
                reply.error(e.to_string());
                return;
            }
        };

        match self
            .store
            .put(reply.user_id.as_str(), Arc::new(set), generation)
            .await
        {
            Ok(PutOutcome::Stored { .. }) => {
                reply.status(format!(
                    "Successfully processed '{filename}'. Ready to answer questions."
                ));
            }
            Ok(PutOutcome::Superseded { .. }) => {
                reply.status(format!(
                    "Skipped '{filename}': a newer upload is already loaded."
                ));
            }
            Err(e) => {
                error!(user_id = %reply.user_id, error = %e, "could not store passage set");
                reply.error(e.to_string());
            }
        }
    }

    async fn ask(&self, reply: Reply, question: String) {
        let set = match self.store.get(&reply.user_id).await {
            Ok(Some(set)) => set,
            Ok(None) => {
                reply.error(PipelineError::NoDocument.to_string());
                return;
            }
            Err(e) => {
                reply.error(e.to_string());
                return;
            }
        };

        match self.pipeline.answer(&question, &set).await {
            Ok(stream) => stream_reply(stream, &reply).await,
            Err(e) => {
                warn!(user_id = %reply.user_id, error = %e, "answer failed");
                reply.error(e.to_string());
            }
        }
    }

    async fn general_chat(&self, reply: Reply, message: String) {
        match self.pipeline.general_chat(&message).await {
            Ok(stream) => stream_reply(stream, &reply).await,
            Err(e) => {
                warn!(user_id = %reply.user_id, error = %e, "general chat failed");
                reply.error(e.to_string());
            }
        }
    }
}

/// Forward tokens as `answer_chunk`s, then `answer_end`. A generation error
/// is reported as `error` and the stream is not terminated with `answer_end`.
async fn stream_reply(mut stream: TokenStream, reply: &Reply) {
    let mut emitted = 0usize;
    while let Some(event) = stream.recv().await {
        match event {
            GenerationEvent::Token(token) => {
                emitted += 1;
                if !reply.chunk(token) {
                    debug!(user_id = %reply.user_id, "link closed mid-stream");
                    return;
                }
            }
            GenerationEvent::Error(e) => {
                warn!(user_id = %reply.user_id, error = %e, "generation failed mid-stream");
                reply.error(format!("Error generating response: {e}"));
                return;
            }
            GenerationEvent::Done => break,
        }
    }

    if emitted == 0 {
        reply.chunk(EMPTY_RESPONSE.to_string());
    }
    reply.end();
    debug!(user_id = %reply.user_id, tokens = emitted, "answer streamed");
}
