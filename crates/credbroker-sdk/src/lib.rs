//! # credbroker-sdk
//!
//! the agent side of the credential broker: pair with a running broker over
//! loopback HTTP, then ask it for credentials one domain at a time. mirrors
//! [`credbroker_broker::registry`] and [`credbroker_broker::router`] from the
//! other side of the wire, reusing [`credbroker_core::PakeEngine`] and
//! [`credbroker_core::SecretCell`] so both processes speak exactly the same
//! handshake and envelope format.
//!
//! ```text
//! AgentClient::pair       ──▶  POST /pairing/initiate
//!                         ◀──  pairing_code (shown to the human)
//!                          …   POST /pairing/exchange (polled every ~2s)
//!                         ◀──  202 waiting | 200 session_id + server pake_message
//!
//! AgentClient::request    ──▶  POST /credential/request (encrypted envelope)
//!                         ◀──  approved | denied | not_found
//! ```

pub mod client;
pub mod error;

pub use client::{AgentClient, PairedSession, RequestOutcome};
pub use error::{Error, Result};
