//! append-only audit trail
//!
//! one JSON object per line, metadata only: no credential bytes, no key
//! material, ever. kept separate from the `tracing` developer log so an
//! operator can ship it somewhere durable without also shipping debug noise.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Request,
    Approved,
    Denied,
    Success,
    NotFound,
    Error,
    Revoked,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub agent_id: String,
    pub domain: String,
    pub reason: String,
}

impl AuditEvent {
    pub fn new(kind: EventKind, agent_id: impl Into<String>, domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            agent_id: agent_id.into(),
            domain: domain.into(),
            reason: reason.into(),
        }
    }
}

/// an append-only log; disabled (events dropped) when no path is configured.
pub struct AuditLog {
    file: Option<Mutex<std::fs::File>>,
}

impl AuditLog {
    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn open(path: &PathBuf) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    pub fn record(&self, event: AuditEvent) {
        let Some(file) = &self.file else { return };
        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        let mut f = file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(f, "{line}") {
            tracing::warn!(error = %e, "failed to append audit event");
        }
    }
}
