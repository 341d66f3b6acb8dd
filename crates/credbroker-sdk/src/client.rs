//! the agent side of the handshake and request/response cycle: the mirror
//! image of `credbroker_broker::registry` and `credbroker_broker::router`.
//!
//! modeled on `ghettobox::network::NetworkClient`: a thin struct wrapping a
//! `reqwest::Client` and a base URL, with one async method per broker
//! endpoint, each building a request struct and mapping transport failures
//! into the crate's `Error` enum.

use std::time::Duration;

use chrono::Utc;
use credbroker_core::{wire, PakeEngine, Role, SecretCell};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const PAIRING_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PAIRING_DEADLINE: Duration = Duration::from_secs(60);
const MAX_TRANSIENT_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// a completed pairing: the session the broker minted plus the client's
/// half of the ready `PakeEngine`. Holding this is what lets `request`
/// encrypt/decrypt without re-running the handshake.
pub struct PairedSession {
    pub session_id: String,
    pub agent_id: String,
    pub agent_name: String,
    engine: PakeEngine,
    usable: bool,
}

impl PairedSession {
    pub fn is_usable(&self) -> bool {
        self.usable
    }
}

/// the decision returned by a completed `/credential/request` cycle. a
/// decrypt failure on the reply is not representable here: it is fatal for
/// the session and surfaces as `Error::SessionUnusable` instead, per the
/// broker's "protocol failures invalidate the session" rule.
pub enum RequestOutcome {
    Approved { username: SecretCell, password: SecretCell },
    Denied { reason: String },
    NotFound { reason: String },
}

/// the agent-side SDK. one instance can pair with, and then make requests
/// against, one broker at `base_url`.
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// `/pairing/initiate` then poll `/pairing/exchange` until the user
    /// confirms the code (broker returns 200) or the client-side deadline
    /// (60s default) lapses. Returns the displayed pairing code's matching
    /// session only on success; callers show the code to the agent's human
    /// via whatever surface they have (stdout, a UI element, a log line).
    pub async fn pair(&self, agent_id: &str, agent_name: &str) -> Result<(String, PairedSession)> {
        #[derive(Serialize)]
        struct InitiateRequest<'a> {
            agent_id: &'a str,
            agent_name: &'a str,
        }
        #[derive(Deserialize)]
        struct InitiateResponse {
            pairing_code: String,
        }

        let initiate: InitiateResponse = self
            .post_with_retry(
                "/pairing/initiate",
                &InitiateRequest { agent_id, agent_name },
            )
            .await?;
        let pairing_code = initiate.pairing_code;

        let mut engine = PakeEngine::new(Role::Client);
        let mut code_bytes = pairing_code.as_bytes().to_vec();
        let client_message = engine.start(&mut code_bytes)?;

        #[derive(Serialize)]
        struct ExchangeRequest<'a> {
            pairing_code: &'a str,
            pake_message: String,
        }
        #[derive(Deserialize)]
        struct ExchangeSuccess {
            session_id: String,
            pake_message: String,
            agent_id: String,
        }

        let req = ExchangeRequest {
            pairing_code: &pairing_code,
            pake_message: wire::encode(&client_message),
        };

        let deadline = tokio::time::Instant::now() + PAIRING_DEADLINE;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::PairingTimeout);
            }

            let resp = self.send_with_retry("/pairing/exchange", &req).await?;

            match resp.status().as_u16() {
                202 => {
                    tokio::time::sleep(PAIRING_POLL_INTERVAL.min(
                        deadline.saturating_duration_since(tokio::time::Instant::now()),
                    ))
                    .await;
                    continue;
                }
                200 => {
                    let body: ExchangeSuccess = resp
                        .json()
                        .await
                        .map_err(|e| Error::MalformedResponse(e.to_string()))?;
                    let server_message = wire::decode(&body.pake_message)?;
                    engine.finish(&server_message)?;
                    let session = PairedSession {
                        session_id: body.session_id,
                        agent_id: body.agent_id,
                        agent_name: agent_name.to_string(),
                        engine,
                        usable: true,
                    };
                    return Ok((pairing_code, session));
                }
                status if (400..500).contains(&status) => {
                    return Err(Error::Rejected {
                        status,
                        message: resp.text().await.unwrap_or_default(),
                    });
                }
                status => {
                    return Err(Error::Unavailable { status });
                }
            }
        }
    }

    /// build, encrypt, and send a credential request; decrypt the reply.
    /// network/5xx failures retry with backoff; 4xx do not; a decrypt
    /// failure on the reply is fatal and marks `session` unusable.
    pub async fn request(
        &self,
        session: &mut PairedSession,
        domain: &str,
        reason: &str,
    ) -> Result<RequestOutcome> {
        #[derive(Serialize)]
        struct RequestEnvelope<'a> {
            domain: &'a str,
            reason: &'a str,
            agent_id: &'a str,
            agent_name: &'a str,
            timestamp: chrono::DateTime<Utc>,
            nonce: String,
        }
        #[derive(Deserialize)]
        struct ResponseEnvelope {
            username: String,
            password: String,
        }
        #[derive(Serialize)]
        struct Wire<'a> {
            session_id: &'a str,
            encrypted_payload: String,
        }
        #[derive(Deserialize)]
        struct WireResponse {
            status: String,
            #[serde(default)]
            encrypted_payload: Option<String>,
            #[serde(default)]
            error: Option<String>,
        }

        let envelope = RequestEnvelope {
            domain,
            reason,
            agent_id: &session.agent_id,
            agent_name: &session.agent_name,
            timestamp: Utc::now(),
            nonce: random_nonce(),
        };
        let plaintext = serde_json::to_vec(&envelope).map_err(|e| Error::MalformedResponse(e.to_string()))?;
        let ciphertext = session.engine.encrypt(&plaintext)?;

        let wire_req = Wire {
            session_id: &session.session_id,
            encrypted_payload: wire::encode(&ciphertext),
        };

        let resp: WireResponse = self.post_with_retry("/credential/request", &wire_req).await?;

        match resp.status.as_str() {
            "approved" => {
                let payload = resp
                    .encrypted_payload
                    .ok_or_else(|| Error::MalformedResponse("approved response missing encrypted_payload".into()))?;
                let ciphertext = wire::decode(&payload)?;
                let plaintext = match session.engine.decrypt(&ciphertext) {
                    Ok(p) => p,
                    Err(_) => {
                        session.usable = false;
                        return Err(Error::SessionUnusable);
                    }
                };
                let env: ResponseEnvelope = serde_json::from_slice(&plaintext)
                    .map_err(|e| Error::MalformedResponse(e.to_string()))?;
                Ok(RequestOutcome::Approved {
                    username: SecretCell::new(env.username.into_bytes()),
                    password: SecretCell::new(env.password.into_bytes()),
                })
            }
            "denied" => Ok(RequestOutcome::Denied {
                reason: resp.error.unwrap_or_default(),
            }),
            "not_found" => Ok(RequestOutcome::NotFound {
                reason: resp.error.unwrap_or_default(),
            }),
            other => Err(Error::MalformedResponse(format!("unexpected status {other:?}"))),
        }
    }

    /// `POST` a JSON body and parse a JSON response, retrying transient
    /// network and 5xx failures (see [`Self::send_with_retry`]). 4xx
    /// responses are surfaced as `Error::Rejected` without retrying.
    async fn post_with_retry<Req: Serialize, Res: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Res> {
        let resp = self.send_with_retry(path, body).await?;
        let status = resp.status();
        if status.is_success() {
            return resp.json().await.map_err(|e| Error::MalformedResponse(e.to_string()));
        }
        let message = resp.text().await.unwrap_or_default();
        Err(Error::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    /// `POST` a JSON body, retrying transient network errors and 5xx
    /// responses up to `MAX_TRANSIENT_RETRIES` times with exponential
    /// backoff from `INITIAL_BACKOFF`. Returns the raw response on any 2xx,
    /// 3xx, or 4xx status (4xx is not retried) so callers that need to
    /// branch on status codes other than success/failure — `/pairing/exchange`
    /// branches on 202 vs 200 — can inspect it themselves.
    async fn send_with_retry<Req: Serialize>(&self, path: &str, body: &Req) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 0..=MAX_TRANSIENT_RETRIES {
            let outcome = self.http.post(&url).json(body).send().await;
            match outcome {
                Ok(resp) if resp.status().as_u16() < 500 => return Ok(resp),
                Ok(resp) if attempt == MAX_TRANSIENT_RETRIES => {
                    return Err(Error::Unavailable { status: resp.status().as_u16() })
                }
                Err(e) if attempt == MAX_TRANSIENT_RETRIES => return Err(Error::Transport(e.to_string())),
                _ => {}
            }
            tracing::warn!(attempt, path, "transient failure, retrying after backoff");
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        unreachable!("loop always returns by its final iteration")
    }
}

/// >=64 bits of randomness as lowercase hex, per spec.md's envelope nonce field
fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_nonce_is_hex_and_long_enough() {
        let nonce = random_nonce();
        assert!(nonce.len() >= 16);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_two_nonces_differ() {
        assert_ne!(random_nonce(), random_nonce());
    }

    #[tokio::test]
    async fn test_pair_and_request_happy_path() {
        let server = mock_broker::MockBroker::start().await;
        server.enqueue_pairing("847293");
        server.enqueue_exchange_waiting();
        server.enqueue_exchange_success();
        server.enqueue_credential_approved("test-user@example.com", "TestPassword123!");

        let client = AgentClient::new(server.base_url());
        let (code, mut session) = client.pair("flight-001", "Flight Agent").await.unwrap();
        assert_eq!(code, "847293");

        match client.request(&mut session, "aa.com", "Logging in").await.unwrap() {
            RequestOutcome::Approved { username, password } => {
                assert_eq!(username.borrow().unwrap(), b"test-user@example.com");
                assert_eq!(password.borrow().unwrap(), b"TestPassword123!");
            }
            _ => panic!("expected Approved"),
        }
    }

    /// a tiny scripted HTTP server standing in for the broker, grounded on
    /// the same "build a request struct, hand it to reqwest" shape the SDK
    /// itself uses — no broker code is depended on here, only its wire
    /// shapes, keeping this test a true black-box client test.
    mod mock_broker {
        use super::*;
        use axum::extract::State;
        use axum::routing::post;
        use axum::{Json, Router};
        use std::sync::Arc;
        use tokio::sync::Mutex;

        #[derive(Default)]
        struct Script {
            pairing_code: String,
            exchange_responses: std::collections::VecDeque<(u16, serde_json::Value)>,
            credential_responses: std::collections::VecDeque<serde_json::Value>,
            server_engine: Option<credbroker_core::PakeEngine>,
        }

        pub struct MockBroker {
            script: Arc<Mutex<Script>>,
            addr: std::net::SocketAddr,
        }

        impl MockBroker {
            pub async fn start() -> Self {
                let script = Arc::new(Mutex::new(Script::default()));
                let app = Router::new()
                    .route("/pairing/initiate", post(Self::initiate))
                    .route("/pairing/exchange", post(Self::exchange))
                    .route("/credential/request", post(Self::credential))
                    .with_state(script.clone());
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                tokio::spawn(async move {
                    axum::serve(listener, app).await.ok();
                });
                Self { script, addr }
            }

            pub fn base_url(&self) -> String {
                format!("http://{}", self.addr)
            }

            pub fn enqueue_pairing(&self, code: &str) {
                self.script.try_lock().unwrap().pairing_code = code.to_string();
            }

            pub fn enqueue_exchange_waiting(&self) {
                self.script
                    .try_lock()
                    .unwrap()
                    .exchange_responses
                    .push_back((202, serde_json::json!({ "status": "waiting" })));
            }

            pub fn enqueue_exchange_success(&self) {
                self.script.try_lock().unwrap().exchange_responses.push_back((200, serde_json::Value::Null));
            }

            pub fn enqueue_credential_approved(&self, username: &str, password: &str) {
                self.script.try_lock().unwrap().credential_responses.push_back(serde_json::json!({
                    "username": username,
                    "password": password,
                }));
            }

            async fn initiate(
                State(script): State<Arc<Mutex<Script>>>,
                Json(_req): Json<serde_json::Value>,
            ) -> Json<serde_json::Value> {
                let s = script.lock().await;
                Json(serde_json::json!({
                    "pairing_code": s.pairing_code,
                    "expires_at": chrono::Utc::now(),
                }))
            }

            async fn exchange(
                State(script): State<Arc<Mutex<Script>>>,
                Json(req): Json<serde_json::Value>,
            ) -> axum::response::Response {
                use axum::response::IntoResponse;
                let mut s = script.lock().await;
                let (status, mut body) = s.exchange_responses.pop_front().unwrap_or((500, serde_json::Value::Null));
                if status == 200 {
                    let client_message = wire::decode(req["pake_message"].as_str().unwrap()).unwrap();
                    let mut server_engine = credbroker_core::PakeEngine::new(credbroker_core::Role::Server);
                    let mut code_bytes = req["pairing_code"].as_str().unwrap().as_bytes().to_vec();
                    let server_message = server_engine.start(&mut code_bytes).unwrap();
                    server_engine.finish(&client_message).unwrap();
                    s.server_engine = Some(server_engine);
                    body = serde_json::json!({
                        "session_id": "test-session",
                        "pake_message": wire::encode(&server_message),
                        "agent_id": "flight-001",
                    });
                }
                (axum::http::StatusCode::from_u16(status).unwrap(), Json(body)).into_response()
            }

            async fn credential(
                State(script): State<Arc<Mutex<Script>>>,
                Json(req): Json<serde_json::Value>,
            ) -> Json<serde_json::Value> {
                let mut s = script.lock().await;
                let scripted = s.credential_responses.pop_front().unwrap();
                let payload = wire::decode(req["encrypted_payload"].as_str().unwrap()).unwrap();
                let engine = s.server_engine.as_ref().unwrap();
                let _plaintext = engine.decrypt(&payload).unwrap();
                let response_plain = serde_json::to_vec(&serde_json::json!({
                    "username": scripted["username"],
                    "password": scripted["password"],
                    "timestamp": chrono::Utc::now(),
                    "nonce": "deadbeefdeadbeef",
                }))
                .unwrap();
                let ciphertext = engine.encrypt(&response_plain).unwrap();
                Json(serde_json::json!({
                    "status": "approved",
                    "encrypted_payload": wire::encode(&ciphertext),
                }))
            }
        }
    }
}
