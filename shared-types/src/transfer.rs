//! Chunked transfer of uploads across the relay.
//!
//! The gateway base64-encodes an upload once and slices the encoded text into
//! fragments small enough to fit a WebSocket frame. The worker feeds the
//! fragments into a [`Reassembler`] keyed by session identifier and decodes
//! the concatenation once `upload_end` arrives. Fragment boundaries are
//! arbitrary; only arrival order matters.
//!
//! A buffer that grows past the decoded size limit is dropped on the spot,
//! and buffers left open longer than the idle limit are reclaimed whenever
//! another upload starts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("No upload in progress for {0}")]
    MissingBuffer(String),

    #[error("Upload payload is not valid base64: {0}")]
    Decode(String),

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
}

/// Base64-encode `bytes` and split the text into fragments of at most
/// `fragment_len` characters. An empty payload yields no fragments.
pub fn fragment(bytes: &[u8], fragment_len: usize) -> Vec<String> {
    let encoded = STANDARD.encode(bytes);
    let fragment_len = fragment_len.max(1);
    // base64 output is ASCII, so byte offsets are char boundaries.
    encoded
        .as_bytes()
        .chunks(fragment_len)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

struct UploadBuffer {
    filename: String,
    fragments: Vec<String>,
    encoded_len: usize,
    started_at: Instant,
}

/// A fully reassembled upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Whether an `append` landed in an open buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { fragments: usize },
    NoOpenBuffer,
}

/// Per-identifier upload buffers.
pub struct Reassembler {
    buffers: HashMap<String, UploadBuffer>,
    max_bytes: usize,
    max_age: Option<Duration>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self {
            buffers: HashMap::new(),
            max_bytes: usize::MAX,
            max_age: None,
        }
    }
}

impl Reassembler {
    /// Unbounded reassembler; see [`Reassembler::with_limits`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap each upload at `max_bytes` decoded bytes and reclaim buffers
    /// that stay open longer than `max_age`.
    pub fn with_limits(max_bytes: usize, max_age: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            max_bytes,
            max_age: Some(max_age),
        }
    }

    /// Largest base64 length whose decoding fits in `max_bytes`.
    fn max_encoded_len(&self) -> usize {
        self.max_bytes
            .div_ceil(3)
            .saturating_mul(4)
    }

    /// Open a buffer for `id`, discarding any incomplete one.
    pub fn start(&mut self, id: &str, filename: &str) {
        self.reclaim_stale();
        let previous = self.buffers.insert(
            id.to_string(),
            UploadBuffer {
                filename: filename.to_string(),
                fragments: Vec::new(),
                encoded_len: 0,
                started_at: Instant::now(),
            },
        );
        if let Some(prev) = previous {
            warn!(
                user_id = %id,
                discarded = %prev.filename,
                fragments = prev.fragments.len(),
                age_ms = prev.started_at.elapsed().as_millis() as u64,
                "Replacing incomplete upload"
            );
        }
    }

    /// Append one fragment. A fragment with no open buffer is logged and
    /// ignored; one that pushes the upload past the size limit drops the
    /// whole buffer.
    pub fn append(&mut self, id: &str, fragment: String) -> Result<AppendOutcome, TransferError> {
        let max_encoded = self.max_encoded_len();
        let Some(buffer) = self.buffers.get_mut(id) else {
            warn!(user_id = %id, "upload_chunk without upload_start; ignoring");
            return Ok(AppendOutcome::NoOpenBuffer);
        };

        buffer.encoded_len = buffer.encoded_len.saturating_add(fragment.len());
        if buffer.encoded_len > max_encoded {
            if let Some(dropped) = self.buffers.remove(id) {
                warn!(
                    user_id = %id,
                    filename = %dropped.filename,
                    limit = self.max_bytes,
                    "upload over size limit; buffer dropped"
                );
            }
            return Err(TransferError::TooLarge {
                limit: self.max_bytes,
            });
        }

        buffer.fragments.push(fragment);
        Ok(AppendOutcome::Appended {
            fragments: buffer.fragments.len(),
        })
    }

    /// Drop buffers open longer than the idle limit. Returns how many went.
    pub fn reclaim_stale(&mut self) -> usize {
        let Some(max_age) = self.max_age else {
            return 0;
        };
        let before = self.buffers.len();
        self.buffers.retain(|id, buffer| {
            let keep = buffer.started_at.elapsed() < max_age;
            if !keep {
                warn!(
                    user_id = %id,
                    filename = %buffer.filename,
                    fragments = buffer.fragments.len(),
                    "abandoned upload reclaimed"
                );
            }
            keep
        });
        before - self.buffers.len()
    }

    /// Close the buffer for `id` and decode its contents. The buffer is
    /// removed whether or not decoding succeeds.
    pub fn finish(&mut self, id: &str) -> Result<CompletedUpload, TransferError> {
        let buffer = self
            .buffers
            .remove(id)
            .ok_or_else(|| TransferError::MissingBuffer(id.to_string()))?;

        let encoded = buffer.fragments.concat();
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| TransferError::Decode(e.to_string()))?;

        debug!(
            user_id = %id,
            filename = %buffer.filename,
            fragments = buffer.fragments.len(),
            bytes = bytes.len(),
            "Upload reassembled"
        );

        Ok(CompletedUpload {
            filename: buffer.filename,
            bytes,
        })
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.buffers.contains_key(id)
    }

    pub fn open_count(&self) -> usize {
        self.buffers.len()
    }
}
