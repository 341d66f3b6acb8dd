//! broker-wide error taxonomy
//!
//! mirrors `credbroker_core::Error`'s one-flat-enum-per-crate shape, scoped
//! to the session/registry/dispatcher/router concerns that live in this
//! crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("session not found or expired")]
    SessionExpired,

    #[error("session was revoked")]
    SessionRevoked,

    #[error("decrypt failed")]
    DecryptFailure,

    #[error("request timestamp outside the allowed window")]
    StaleTimestamp,

    #[error("nonce already used within the timestamp window")]
    DuplicateNonce,

    #[error("pairing code unknown or expired")]
    BadPairingCode,

    #[error("pake handshake failed: {0}")]
    PakeReject(String),

    #[error("approval wait timed out")]
    Timeout,

    #[error("approval request cancelled: session revoked mid-wait")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] credbroker_core::Error),
}
