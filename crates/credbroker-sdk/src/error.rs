//! error taxonomy for the agent-side SDK

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// the HTTP call itself failed (connection refused, DNS, I/O)
    #[error("transport error: {0}")]
    Transport(String),

    /// broker returned a 4xx; not retried
    #[error("broker rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// broker returned a 5xx after exhausting retries
    #[error("broker unavailable after retries ({status})")]
    Unavailable { status: u16 },

    /// pairing did not complete before the client-side deadline
    #[error("pairing timed out waiting for user confirmation")]
    PairingTimeout,

    /// a response envelope failed to decrypt; the session is no longer
    /// trustworthy and must be re-paired
    #[error("response decrypt failed, session is no longer usable")]
    SessionUnusable,

    /// the broker's reply could not be parsed as the expected envelope shape
    #[error("malformed response from broker: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Core(#[from] credbroker_core::Error),
}
