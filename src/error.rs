//! Crate-wide error type and the wire-level protocol error codes.
//!
//! Two tiers, matching the rest of this crate's modules: `Error` is the
//! internal, Rust-side error any module's fallible operation returns;
//! `ProtocolErrorCode` is the small, stable set of codes carried on the wire
//! in an envelope's `payload.error_code` field (see the message codec).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("checksum failed")]
    ChecksumFailed,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("unknown sender")]
    UnknownSender,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("invalid session state: expected {expected}, found {found}")]
    InvalidSessionState { expected: String, found: String },

    #[error("sequence error: expected {expected}, received {received}")]
    SequenceError { expected: u64, received: u64 },

    #[error("replay detected")]
    ReplayDetected,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("send failed after {attempts} attempts: {last_error}")]
    SendFailed { attempts: u32, last_error: String },

    #[error("network timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("dht error: {0}")]
    Dht(String),

    #[error("node not found")]
    NodeNotFound,

    #[error("transfer {0} not found or expired")]
    TransferNotFound(String),

    #[error("handler already registered for message type {0}")]
    HandlerAlreadyRegistered(String),

    #[error("no handler registered for message type {0}")]
    NoHandlerRegistered(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps an internal error to the wire-level code it should be reported
    /// as, where a direct mapping exists. Errors with no wire-level
    /// counterpart (config, persistence, internal bugs) are never sent to a
    /// peer and have no mapping.
    pub fn protocol_code(&self) -> Option<ProtocolErrorCode> {
        match self {
            Error::DecryptionFailed => Some(ProtocolErrorCode::DecryptionFailed),
            Error::SessionExpired(_) => Some(ProtocolErrorCode::SessionExpired),
            Error::SequenceError { .. } => Some(ProtocolErrorCode::SequenceError),
            Error::ReplayDetected => Some(ProtocolErrorCode::ReplayDetected),
            Error::ChecksumFailed => Some(ProtocolErrorCode::ChecksumFailed),
            Error::UnsupportedVersion(_) => Some(ProtocolErrorCode::UnsupportedVersion),
            Error::UnknownSender | Error::InvalidSignature => {
                Some(ProtocolErrorCode::UnknownSender)
            }
            Error::SendFailed { .. } | Error::Timeout | Error::Network(_) => {
                Some(ProtocolErrorCode::SendFailed)
            }
            Error::RateLimited { .. } => Some(ProtocolErrorCode::RateLimited),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Network(_) | Error::Io(_)
        )
    }
}

/// The nine wire-level error codes named in the message codec's external
/// interface. Carried in `payload.error_code` of an `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolErrorCode {
    DecryptionFailed,
    SessionExpired,
    SequenceError,
    ReplayDetected,
    ChecksumFailed,
    UnsupportedVersion,
    UnknownSender,
    SendFailed,
    RateLimited,
}
