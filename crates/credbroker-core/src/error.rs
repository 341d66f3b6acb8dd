//! error types shared by the pake engine, secret cell, and vault-driver boundary

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// `start`/`finish` called out of order, or called twice
    #[error("pake engine used out of order")]
    ProtocolMisuse,

    /// the spake2 library rejected the peer's message
    #[error("pake handshake failed")]
    PakeFailure,

    /// encrypt/decrypt attempted before `finish` completed
    #[error("pake engine not ready")]
    NotReady,

    /// aead tag verification failed, or ciphertext was malformed
    #[error("decrypt failed")]
    DecryptFailure,

    /// aead encryption failed (oversized plaintext)
    #[error("encrypt failed")]
    EncryptFailure,

    /// operation attempted on a secret cell that has already been cleared
    #[error("secret cell has been cleared")]
    Cleared,

    /// wire decoding (base64/utf8) failed
    #[error("invalid wire encoding: {0}")]
    InvalidEncoding(String),

    /// the vault driver rejected the master secret
    #[error("vault rejected master secret")]
    WrongMaster,

    /// the vault driver failed for a reason unrelated to the master secret
    #[error("vault driver error: {0}")]
    VaultDriver(String),
}
