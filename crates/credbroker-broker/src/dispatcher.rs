//! bridges the `/credential/request` handler and the human at the approver
//! surface: one prompt, one vault transaction, one verdict.

use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use credbroker_core::{SecretCell, VaultDriver, VaultOrchestrator, VaultOutcome};

use crate::registry::SessionMetadata;

const DEFAULT_MASTER_SECRET_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Timeout,
    Cancelled,
    VaultDriver,
}

#[derive(Debug)]
pub enum Decision {
    /// the credential, still wrapped in `SecretCell` the moment it leaves
    /// the vault — never a bare `String` that could linger unscrubbed
    /// between here and the HTTP response.
    Approve { username: SecretCell, password: SecretCell },
    Deny { reason: String },
    Error { kind: ErrorKind, detail: String },
}

/// the capability the dispatcher needs from whatever is showing prompts to
/// the human. `begin_prompt` must return promptly — the actual wait for a
/// human answer happens on the dispatcher's side, polling the receiver, so
/// that a mid-wait session revocation can be observed without leaning on the
/// prompter's internals.
pub trait ApprovalPrompter: Send + Sync {
    fn begin_prompt(
        &self,
        agent_id: &str,
        agent_name: &str,
        domain: &str,
        reason: &str,
    ) -> mpsc::Receiver<bool>;

    /// `None` means the prompter could not obtain a secret (e.g. the human
    /// closed the vault-unlock dialog).
    fn collect_master_secret(&self) -> Option<SecretCell>;
}

pub struct ApprovalDispatcher<P: ApprovalPrompter, D: VaultDriver> {
    prompter: P,
    vault: VaultOrchestrator<D>,
    serialize: Mutex<()>,
    approval_wait: Duration,
    max_master_secret_attempts: u32,
}

impl<P: ApprovalPrompter, D: VaultDriver> ApprovalDispatcher<P, D> {
    pub fn new(prompter: P, vault: VaultOrchestrator<D>, approval_wait: Duration) -> Self {
        Self {
            prompter,
            vault,
            serialize: Mutex::new(()),
            approval_wait,
            max_master_secret_attempts: DEFAULT_MASTER_SECRET_ATTEMPTS,
        }
    }

    /// per-session ordering is the router's job (sessions are single-writer
    /// already per §5); this mutex only keeps two *different* sessions from
    /// racing for the same terminal, per the implementer's choice the spec
    /// leaves open.
    pub fn dispatch(
        &self,
        session: &SessionMetadata,
        domain: &str,
        reason: &str,
        is_revoked: impl Fn() -> bool,
    ) -> Decision {
        let _serial = self.serialize.lock().unwrap_or_else(|e| e.into_inner());

        let rx = self
            .prompter
            .begin_prompt(&session.agent_id, &session.agent_name, domain, reason);

        let deadline = Instant::now() + self.approval_wait;
        let poll_interval = Duration::from_millis(200);

        let approved = loop {
            if is_revoked() {
                return Decision::Error {
                    kind: ErrorKind::Cancelled,
                    detail: "session revoked while awaiting approval".into(),
                };
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Decision::Error {
                    kind: ErrorKind::Timeout,
                    detail: "approval wait timed out".into(),
                };
            }
            match rx.recv_timeout(poll_interval.min(remaining)) {
                Ok(answer) => break answer,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Decision::Error {
                        kind: ErrorKind::VaultDriver,
                        detail: "prompter disconnected before answering".into(),
                    }
                }
            }
        };

        if !approved {
            return Decision::Deny {
                reason: "user declined".into(),
            };
        }
        if is_revoked() {
            return Decision::Error {
                kind: ErrorKind::Cancelled,
                detail: "session revoked after approval".into(),
            };
        }

        for attempt in 1..=self.max_master_secret_attempts {
            let cell = match self.prompter.collect_master_secret() {
                Some(c) => c,
                None => {
                    return Decision::Error {
                        kind: ErrorKind::VaultDriver,
                        detail: "master secret unavailable".into(),
                    }
                }
            };
            match self.vault.fetch(domain, &cell) {
                Ok(VaultOutcome::Credential { username, password }) => {
                    return Decision::Approve { username, password }
                }
                Ok(VaultOutcome::NotFound) => {
                    return Decision::Error {
                        kind: ErrorKind::NotFound,
                        detail: "no matching login in vault".into(),
                    }
                }
                Ok(VaultOutcome::WrongMaster) if attempt < self.max_master_secret_attempts => {
                    continue;
                }
                Ok(VaultOutcome::WrongMaster) => {
                    return Decision::Error {
                        kind: ErrorKind::VaultDriver,
                        detail: "wrong master secret".into(),
                    }
                }
                Ok(VaultOutcome::DriverError { kind }) => {
                    return Decision::Error {
                        kind: ErrorKind::VaultDriver,
                        detail: kind,
                    }
                }
                Err(e) => {
                    return Decision::Error {
                        kind: ErrorKind::VaultDriver,
                        detail: e.to_string(),
                    }
                }
            }
        }
        unreachable!("loop always returns on its final iteration")
    }
}

/// reads prompts and answers from the controlling terminal. used by the
/// local and remote binaries alike; `collect_master_secret` blocks on a
/// line of input rather than masking it, since the master secret already
/// has to cross whatever out-of-band channel feeds this process's stdin.
pub struct TerminalPrompter;

impl ApprovalPrompter for TerminalPrompter {
    fn begin_prompt(
        &self,
        agent_id: &str,
        agent_name: &str,
        domain: &str,
        reason: &str,
    ) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel();
        let agent_id = agent_id.to_string();
        let agent_name = agent_name.to_string();
        let domain = domain.to_string();
        let reason = reason.to_string();
        std::thread::spawn(move || {
            println!(
                "\n[credbroker] {agent_name} ({agent_id}) wants a credential for {domain}\n  reason: {reason}\n  approve? [y/N] "
            );
            let mut line = String::new();
            let answer = std::io::stdin().read_line(&mut line).is_ok()
                && matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes");
            let _ = tx.send(answer);
        });
        rx
    }

    fn collect_master_secret(&self) -> Option<SecretCell> {
        print!("[credbroker] vault master password: ");
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return None;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            return None;
        }
        Some(SecretCell::new(trimmed.as_bytes().to_vec()))
    }
}

/// deterministic test double: pre-programmed answers and master secrets,
/// consumed in call order. modeled on `ghettobox::realm::software`'s
/// test doubles.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    pub struct ScriptedPrompter {
        answers: Mutex<VecDeque<bool>>,
        secrets: Mutex<VecDeque<Option<Vec<u8>>>>,
    }

    impl ScriptedPrompter {
        pub fn new() -> Self {
            Self {
                answers: Mutex::new(VecDeque::new()),
                secrets: Mutex::new(VecDeque::new()),
            }
        }

        pub fn with_answer(self, approved: bool) -> Self {
            self.answers.lock().unwrap().push_back(approved);
            self
        }

        pub fn with_secret(self, secret: impl Into<Vec<u8>>) -> Self {
            self.secrets.lock().unwrap().push_back(Some(secret.into()));
            self
        }

        pub fn with_missing_secret(self) -> Self {
            self.secrets.lock().unwrap().push_back(None);
            self
        }
    }

    impl Default for ScriptedPrompter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ApprovalPrompter for ScriptedPrompter {
        fn begin_prompt(&self, _: &str, _: &str, _: &str, _: &str) -> mpsc::Receiver<bool> {
            let (tx, rx) = mpsc::channel();
            let answer = self.answers.lock().unwrap().pop_front().unwrap_or(false);
            let _ = tx.send(answer);
            rx
        }

        fn collect_master_secret(&self) -> Option<SecretCell> {
            self.secrets
                .lock()
                .unwrap()
                .pop_front()
                .flatten()
                .map(SecretCell::new)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedPrompter;
    use super::*;
    use credbroker_core::vault::mock::MockVaultDriver;
    use chrono::Utc;

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            session_id: "s1".into(),
            agent_id: "agent-1".into(),
            agent_name: "claude-code".into(),
            created_at: Utc::now(),
            last_access: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        }
    }

    #[test]
    fn test_approved_returns_credential() {
        let driver = MockVaultDriver::new("hunter2").with_login(
            "aa.com",
            "test-user@example.com",
            "TestPassword123!",
        );
        let prompter = ScriptedPrompter::new().with_answer(true).with_secret("hunter2");
        let dispatcher = ApprovalDispatcher::new(
            prompter,
            VaultOrchestrator::new(driver),
            Duration::from_secs(5),
        );
        let decision = dispatcher.dispatch(&metadata(), "aa.com", "login", || false);
        match decision {
            Decision::Approve { username, password } => {
                assert_eq!(username.borrow().unwrap(), b"test-user@example.com");
                assert_eq!(password.borrow().unwrap(), b"TestPassword123!");
            }
            other => panic!("expected Approve, got {other:?}"),
        }
    }

    #[test]
    fn test_denied() {
        let driver = MockVaultDriver::new("hunter2");
        let prompter = ScriptedPrompter::new().with_answer(false);
        let dispatcher = ApprovalDispatcher::new(
            prompter,
            VaultOrchestrator::new(driver),
            Duration::from_secs(5),
        );
        let decision = dispatcher.dispatch(&metadata(), "aa.com", "login", || false);
        assert!(matches!(decision, Decision::Deny { .. }));
    }

    #[test]
    fn test_not_found_still_a_decision_not_a_panic() {
        let driver = MockVaultDriver::new("hunter2");
        let prompter = ScriptedPrompter::new().with_answer(true).with_secret("hunter2");
        let dispatcher = ApprovalDispatcher::new(
            prompter,
            VaultOrchestrator::new(driver),
            Duration::from_secs(5),
        );
        let decision = dispatcher.dispatch(&metadata(), "unknown.example", "login", || false);
        match decision {
            Decision::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
            other => panic!("expected NotFound error, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_master_retries_then_gives_up() {
        let driver = MockVaultDriver::new("hunter2");
        let prompter = ScriptedPrompter::new()
            .with_answer(true)
            .with_secret("nope1")
            .with_secret("nope2")
            .with_secret("nope3");
        let dispatcher = ApprovalDispatcher::new(
            prompter,
            VaultOrchestrator::new(driver),
            Duration::from_secs(5),
        );
        let decision = dispatcher.dispatch(&metadata(), "aa.com", "login", || false);
        match decision {
            Decision::Error { kind, .. } => assert_eq!(kind, ErrorKind::VaultDriver),
            other => panic!("expected VaultDriver error, got {other:?}"),
        }
    }

    #[test]
    fn test_revocation_observed_before_vault_unlock() {
        let driver = MockVaultDriver::new("hunter2").with_login(
            "aa.com",
            "test-user@example.com",
            "TestPassword123!",
        );
        let prompter = ScriptedPrompter::new().with_answer(true).with_secret("hunter2");
        let dispatcher = ApprovalDispatcher::new(
            prompter,
            VaultOrchestrator::new(driver),
            Duration::from_secs(5),
        );
        let decision = dispatcher.dispatch(&metadata(), "aa.com", "login", || true);
        assert!(matches!(
            decision,
            Decision::Error {
                kind: ErrorKind::Cancelled,
                ..
            }
        ));
    }
}
