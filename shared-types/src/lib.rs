//! Shared types between the gateway and the worker
//!
//! These types are used by both:
//! - the gateway (session routing, upload fragmenting)
//! - the worker (envelope handling, upload reassembly)
//!
//! Serializable with serde for JSON over WebSocket.

use serde::{Deserialize, Serialize};

pub mod transfer;

pub use transfer::{fragment, CompletedUpload, Reassembler, TransferError};

// ============================================================================
// Constants
// ============================================================================

/// Prefix carried by every guest identifier. Authenticated identities never use it.
pub const GUEST_PREFIX: &str = "guest_";

/// Default size of one upload fragment (base64 characters).
pub const DEFAULT_FRAGMENT_BYTES: usize = 512 * 1024;

/// Every discriminator the relay understands.
pub const KNOWN_TYPES: &[&str] = &[
    "auth",
    "auth_success",
    "upload_start",
    "upload_chunk",
    "upload_end",
    "ask",
    "general_chat",
    "status",
    "answer_chunk",
    "answer_end",
    "error",
    "ping",
];

pub fn is_guest_id(id: &str) -> bool {
    id.starts_with(GUEST_PREFIX)
}

// ============================================================================
// Envelope
// ============================================================================

/// Payload of one relay message, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Worker handshake
    Auth { secret: String },
    /// Session handshake reply; the resolved identity rides in `user_id`
    AuthSuccess,
    UploadStart { filename: String },
    UploadChunk { data: String },
    UploadEnd,
    Ask { data: String },
    GeneralChat { data: String },
    Status { data: String },
    AnswerChunk { data: String },
    AnswerEnd,
    Error { data: String },
    /// Session liveness; never relayed
    Ping,
}

/// Unit of relay traffic.
///
/// `user_id` is stamped by the gateway before anything reaches the worker and
/// names the destination session on the way back. `request_id` correlates an
/// `ask`/`general_chat` with the `status`/`answer_*`/`error` envelopes it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Decode failures at the dispatch boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unknown envelope type: {0}")]
    UnknownType(String),
}

impl Payload {
    /// Wire discriminator of this payload
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Auth { .. } => "auth",
            Payload::AuthSuccess => "auth_success",
            Payload::UploadStart { .. } => "upload_start",
            Payload::UploadChunk { .. } => "upload_chunk",
            Payload::UploadEnd => "upload_end",
            Payload::Ask { .. } => "ask",
            Payload::GeneralChat { .. } => "general_chat",
            Payload::Status { .. } => "status",
            Payload::AnswerChunk { .. } => "answer_chunk",
            Payload::AnswerEnd => "answer_end",
            Payload::Error { .. } => "error",
            Payload::Ping => "ping",
        }
    }

    /// Kinds a browser session is allowed to send into the relay.
    pub fn is_session_originated(&self) -> bool {
        matches!(
            self,
            Payload::UploadStart { .. }
                | Payload::UploadChunk { .. }
                | Payload::UploadEnd
                | Payload::Ask { .. }
                | Payload::GeneralChat { .. }
                | Payload::Ping
        )
    }

    /// Kinds the worker may address to a session.
    pub fn is_worker_originated(&self) -> bool {
        matches!(
            self,
            Payload::Status { .. }
                | Payload::AnswerChunk { .. }
                | Payload::AnswerEnd
                | Payload::Error { .. }
                | Payload::Ping
        )
    }

    /// Kinds that open a streamed request and therefore carry a correlation id.
    pub fn opens_request(&self) -> bool {
        matches!(self, Payload::Ask { .. } | Payload::GeneralChat { .. })
    }
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            user_id: None,
            request_id: None,
        }
    }

    pub fn to_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_ping(&self) -> bool {
        matches!(self.payload, Payload::Ping)
    }

    pub fn auth_success(user_id: &str) -> Self {
        Self::new(Payload::AuthSuccess).to_user(user_id)
    }

    pub fn status(user_id: &str, text: impl Into<String>) -> Self {
        Self::new(Payload::Status { data: text.into() }).to_user(user_id)
    }

    pub fn error(user_id: &str, text: impl Into<String>) -> Self {
        Self::new(Payload::Error { data: text.into() }).to_user(user_id)
    }

    pub fn answer_chunk(user_id: &str, token: impl Into<String>) -> Self {
        Self::new(Payload::AnswerChunk { data: token.into() }).to_user(user_id)
    }

    pub fn answer_end(user_id: &str) -> Self {
        Self::new(Payload::AnswerEnd).to_user(user_id)
    }

    /// Parse one text frame, separating unknown discriminators from other
    /// malformed input.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing \"type\" discriminator".into()))?;

        if !KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
