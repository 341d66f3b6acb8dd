//! # credbroker-broker
//!
//! the human-in-the-loop side of the credential broker: pairing codes,
//! live sessions, the HTTP surface agents talk to, and the bridge to a
//! human approver and an opaque vault driver.
//!
//! wired together in [`main`](../src/main.rs), but exposed as a library so
//! integration tests can build an [`router::AppState`] against a
//! [`dispatcher::mock::ScriptedPrompter`] and a
//! `credbroker_core::vault::mock::MockVaultDriver` without spawning a
//! process.

pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod router;

pub use error::{Error, Result};
