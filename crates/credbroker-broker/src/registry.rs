//! pairing codes and live sessions
//!
//! one mutex guards both maps. every critical section here is a handful of
//! hashmap operations plus, at most, one `PakeEngine::start`/`finish` call —
//! never a wait on user input or the vault, which live behind their own
//! locks in [`crate::dispatcher`] and `credbroker_core::VaultOrchestrator`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use credbroker_core::{PakeEngine, Role};
use rand::RngCore;

use crate::error::{Error, Result};

const NONCE_WINDOW: i64 = 300; // seconds, matches the request timestamp window

/// notified synchronously, under the registry lock, the instant a pairing
/// code is minted. implementations must return quickly (e.g. enqueue onto
/// a channel the approval dispatcher drains) rather than block here.
pub trait PairingNotifier: Send + Sync {
    fn notify_new_pairing(&self, agent_id: &str, agent_name: &str, pairing_code: &str);
}

/// a notifier that does nothing, for registries that are driven purely by
/// polling `pending_pairings` (tests, and the terminal prompter's own loop).
pub struct NullNotifier;

impl PairingNotifier for NullNotifier {
    fn notify_new_pairing(&self, _agent_id: &str, _agent_name: &str, _pairing_code: &str) {}
}

struct PendingPairing {
    agent_id: String,
    agent_name: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    user_confirmed: bool,
    stashed_client_pake_message: Option<Vec<u8>>,
}

/// a live, post-handshake session
pub struct Session {
    pub agent_id: String,
    pub agent_name: String,
    engine: PakeEngine,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    seen_nonces: VecDeque<(String, DateTime<Utc>)>,
}

/// metadata snapshot, safe to hand to callers that shouldn't see the engine
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub session_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// outcome of a client's poll against a pairing code
pub enum ExchangeOutcome {
    /// the user hasn't confirmed the code on the broker side yet
    Waiting,
    /// user confirmed; handshake completed and a session now exists
    Success {
        session_id: String,
        server_pake_message: Vec<u8>,
        agent_id: String,
    },
    /// the code is unknown, expired, or the handshake itself failed
    Rejected(Error),
}

struct State {
    pending: HashMap<String, PendingPairing>,
    sessions: HashMap<String, Session>,
}

pub struct PairingRegistry<N: PairingNotifier = NullNotifier> {
    state: Mutex<State>,
    notifier: N,
    pairing_ttl: Duration,
    session_ttl: Duration,
}

impl<N: PairingNotifier> PairingRegistry<N> {
    pub fn new(notifier: N, pairing_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                pending: HashMap::new(),
                sessions: HashMap::new(),
            }),
            notifier,
            pairing_ttl,
            session_ttl,
        }
    }

    /// mint a fresh pairing code and notify the approval side. the code is a
    /// human-typeable word the spec calls the "short pairing code" — six
    /// decimal digits is enough entropy for a single-use, minute-scale TTL
    /// secret exchanged over a channel the agent's host already trusts.
    pub fn create_pairing(&self, agent_id: &str, agent_name: &str) -> (String, DateTime<Utc>) {
        let now = Utc::now();
        let expires_at = now + self.pairing_ttl;
        let code = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.retain(|_, p| p.expires_at > now);
            loop {
                let candidate = generate_pairing_code();
                if !state.pending.contains_key(&candidate) {
                    state.pending.insert(
                        candidate.clone(),
                        PendingPairing {
                            agent_id: agent_id.to_string(),
                            agent_name: agent_name.to_string(),
                            created_at: now,
                            expires_at,
                            user_confirmed: false,
                            stashed_client_pake_message: None,
                        },
                    );
                    break candidate;
                }
            }
        };
        self.notifier.notify_new_pairing(agent_id, agent_name, &code);
        (code, expires_at)
    }

    /// the human has typed the code into the approval prompt; the next
    /// `exchange` poll will complete the handshake.
    pub fn mark_user_entered(&self, pairing_code: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.pending.get_mut(pairing_code) {
            Some(p) if p.expires_at > Utc::now() => {
                p.user_confirmed = true;
                true
            }
            _ => false,
        }
    }

    /// list pairing codes awaiting user confirmation, for a terminal prompter
    /// or other polling-based dispatcher.
    pub fn pending_pairings(&self) -> Vec<(String, String, String)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        state
            .pending
            .iter()
            .filter(|(_, p)| !p.user_confirmed && p.expires_at > now)
            .map(|(code, p)| (code.clone(), p.agent_id.clone(), p.agent_name.clone()))
            .collect()
    }

    /// the agent's poll against `/pairing/exchange`. idempotent while waiting:
    /// the client's PAKE message is stashed on first contact and reused on
    /// every subsequent poll so the agent can retry freely.
    pub fn exchange(&self, pairing_code: &str, client_pake_message: Vec<u8>) -> ExchangeOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        let pending = match state.pending.get_mut(pairing_code) {
            Some(p) => p,
            None => return ExchangeOutcome::Rejected(Error::BadPairingCode),
        };
        if pending.expires_at <= now {
            state.pending.remove(pairing_code);
            return ExchangeOutcome::Rejected(Error::BadPairingCode);
        }
        if pending.stashed_client_pake_message.is_none() {
            pending.stashed_client_pake_message = Some(client_pake_message);
        }
        if !pending.user_confirmed {
            return ExchangeOutcome::Waiting;
        }

        let pending = state.pending.remove(pairing_code).expect("checked above");
        let stashed = pending
            .stashed_client_pake_message
            .expect("stashed on first poll");

        let mut engine = PakeEngine::new(Role::Server);
        let mut code_bytes = pairing_code.as_bytes().to_vec();
        let server_pake_message = match engine.start(&mut code_bytes) {
            Ok(m) => m,
            Err(e) => return ExchangeOutcome::Rejected(Error::Core(e)),
        };
        if let Err(e) = engine.finish(&stashed) {
            return ExchangeOutcome::Rejected(Error::PakeReject(e.to_string()));
        }

        let session_id = generate_session_id();
        let agent_id = pending.agent_id.clone();
        state.sessions.insert(
            session_id.clone(),
            Session {
                agent_id: pending.agent_id,
                agent_name: pending.agent_name,
                engine,
                created_at: now,
                last_access: now,
                expires_at: now + self.session_ttl,
                seen_nonces: VecDeque::new(),
            },
        );

        ExchangeOutcome::Success {
            session_id,
            server_pake_message,
            agent_id,
        }
    }

    pub fn metadata(&self, session_id: &str) -> Option<SessionMetadata> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sessions.get(session_id).map(|s| SessionMetadata {
            session_id: session_id.to_string(),
            agent_id: s.agent_id.clone(),
            agent_name: s.agent_name.clone(),
            created_at: s.created_at,
            last_access: s.last_access,
            expires_at: s.expires_at,
        })
    }

    /// decrypt an incoming envelope. on success the session's `last_access`
    /// is slid forward; on any failure *other* than expiry the session is
    /// dropped, per the broker's "invalidate on protocol failure" rule.
    pub fn decrypt_for_session(&self, session_id: &str, envelope: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        let session = match state.sessions.get(session_id) {
            Some(s) => s,
            None => return Err(Error::SessionExpired),
        };
        if session.expires_at <= now {
            state.sessions.remove(session_id);
            return Err(Error::SessionExpired);
        }

        match session.engine.decrypt(envelope) {
            Ok(plaintext) => {
                if let Some(s) = state.sessions.get_mut(session_id) {
                    s.last_access = now;
                }
                Ok(plaintext)
            }
            Err(_) => {
                state.sessions.remove(session_id);
                Err(Error::DecryptFailure)
            }
        }
    }

    pub fn encrypt_for_session(&self, session_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let session = state.sessions.get(session_id).ok_or(Error::SessionExpired)?;
        session.engine.encrypt(plaintext).map_err(Error::Core)
    }

    /// reject stale timestamps and replayed nonces without touching the
    /// session itself — these invalidate the single request, not the pairing.
    pub fn check_timestamp_and_nonce(
        &self,
        session_id: &str,
        nonce: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        if (now - timestamp).num_seconds().abs() > NONCE_WINDOW {
            return Err(Error::StaleTimestamp);
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or(Error::SessionExpired)?;

        let cutoff = now - Duration::seconds(NONCE_WINDOW);
        while session
            .seen_nonces
            .front()
            .map(|(_, ts)| *ts < cutoff)
            .unwrap_or(false)
        {
            session.seen_nonces.pop_front();
        }
        if session.seen_nonces.iter().any(|(n, _)| n == nonce) {
            return Err(Error::DuplicateNonce);
        }
        session.seen_nonces.push_back((nonce.to_string(), now));
        Ok(())
    }

    pub fn revoke(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sessions.remove(session_id).is_some()
    }

    /// drop expired pending pairings and sessions. cheap and idempotent;
    /// called from the periodic sweep task and opportunistically from
    /// `exchange`.
    pub fn sweep(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        state.pending.retain(|_, p| p.expires_at > now);
        state.sessions.retain(|_, s| s.expires_at > now);
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).sessions.len()
    }
}

fn generate_pairing_code() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    let n = 100_000 + (u32::from_be_bytes(bytes) % 900_000);
    n.to_string()
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
