//! owned container for in-memory secrets with deterministic, scope-bound clearing

use zeroize::Zeroize;

use crate::error::{Error, Result};

/// owns a sensitive byte buffer. borrowing fails once the cell is cleared;
/// dropping the cell (any control-flow exit from its owning scope, including
/// an early return or a propagated error) clears it exactly once.
pub struct SecretCell {
    bytes: Option<Vec<u8>>,
}

impl SecretCell {
    /// take ownership of `bytes`. the caller must not retain an alias.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes: Some(bytes) }
    }

    /// a read-only view, valid only while the cell has not been cleared
    pub fn borrow(&self) -> Result<&[u8]> {
        self.bytes.as_deref().ok_or(Error::Cleared)
    }

    /// overwrite the buffer and drop it. idempotent.
    pub fn clear(&mut self) {
        if let Some(mut bytes) = self.bytes.take() {
            bytes.zeroize();
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.bytes.is_none()
    }
}

impl Drop for SecretCell {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for SecretCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SecretCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}
