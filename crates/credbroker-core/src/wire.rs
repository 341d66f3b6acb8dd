//! wire encoding helpers
//!
//! every pake message and ciphertext crosses the wire as url-safe base64
//! inside json, matching the encoding `ghettobox::share::Share` uses for
//! its own base64 form.

use base64::Engine;

use crate::error::{Error, Result};

pub fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| Error::InvalidEncoding(e.to_string()))
}
