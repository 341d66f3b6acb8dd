//! # credbroker-core
//!
//! the cryptographic and secret-handling primitives shared by the broker
//! and the agent-side SDK: a SPAKE2 handshake wrapper with the AEAD that
//! rides on top of it, an owned secret-buffer type with deterministic
//! clearing, and the boundary contract for an opaque external vault.
//!
//! ## architecture
//!
//! ```text
//! pairing code (6 digits)
//!        │
//!        ▼
//!   PakeEngine::start  ──(wire: base64)──▶  peer
//!        │
//!   PakeEngine::finish ◀──(wire: base64)──  peer's message
//!        │
//!        ▼
//!   derived AEAD key (cleared on drop)
//!        │
//!   encrypt/decrypt request & response envelopes
//! ```
//!
//! ## security properties
//!
//! - the pairing code never becomes the encryption key directly; SPAKE2
//!   binds it to an ephemeral Diffie-Hellman exchange first
//! - the AEAD key lives only inside a `PakeEngine` and is zeroed on drop
//! - `SecretCell` guarantees a sensitive buffer is overwritten exactly
//!   once, on every control-flow exit from its owning scope
//! - the vault driver is treated as fully opaque; only unlock/list/lock
//!   are ever called, never backend-specific APIs

pub mod error;
pub mod pake;
pub mod secret;
pub mod vault;
pub mod wire;

pub use error::{Error, Result};
pub use pake::{PakeEngine, Role};
pub use secret::SecretCell;
pub use vault::{normalize_domain, VaultDriver, VaultListItem, VaultOrchestrator, VaultOutcome, VaultSessionHandle};
