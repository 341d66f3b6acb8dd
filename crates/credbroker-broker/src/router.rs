//! HTTP surface: translates the six endpoints in the wire protocol into
//! registry/dispatcher operations. No endpoint blocks the registry mutex
//! across a human-input or vault wait; `/credential/request` hands the
//! actual approval wait to a blocking task.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use credbroker_core::{wire, VaultDriver};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use serde_json::json;
use zeroize::Zeroize;

use crate::audit::{AuditEvent, AuditLog, EventKind};
use crate::dispatcher::{ApprovalDispatcher, ApprovalPrompter, Decision, ErrorKind};
use crate::error::Error;
use crate::registry::{ExchangeOutcome, NullNotifier, PairingRegistry};

pub struct AppState<P: ApprovalPrompter + 'static, D: VaultDriver + 'static> {
    pub registry: PairingRegistry<NullNotifier>,
    pub dispatcher: ApprovalDispatcher<P, D>,
    pub audit: AuditLog,
    pub started_at: DateTime<Utc>,
}

pub fn build_router<P, D>(state: Arc<AppState<P, D>>) -> Router
where
    P: ApprovalPrompter + 'static,
    D: VaultDriver + 'static,
{
    Router::new()
        .route("/pairing/initiate", post(pairing_initiate::<P, D>))
        .route("/pairing/exchange", post(pairing_exchange::<P, D>))
        .route("/credential/request", post(credential_request::<P, D>))
        .route("/session/revoke", post(session_revoke::<P, D>))
        .route("/session/status", get(session_status::<P, D>))
        .route("/health", get(health::<P, D>))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn is_printable_within(s: &str, max: usize) -> bool {
    !s.is_empty() && s.chars().count() <= max && s.chars().all(|c| !c.is_control())
}

#[derive(Deserialize)]
struct PairingInitiateRequest {
    agent_id: String,
    agent_name: String,
}

#[derive(Serialize)]
struct PairingInitiateResponse {
    pairing_code: String,
    expires_at: DateTime<Utc>,
}

async fn pairing_initiate<P, D>(
    State(state): State<Arc<AppState<P, D>>>,
    Json(req): Json<PairingInitiateRequest>,
) -> Response
where
    P: ApprovalPrompter + 'static,
    D: VaultDriver + 'static,
{
    let start = Instant::now();
    counter!("credbroker_requests_total", "endpoint" => "pairing_initiate").increment(1);

    if !is_printable_within(&req.agent_id, 128) || !is_printable_within(&req.agent_name, 128) {
        counter!("credbroker_errors_total", "endpoint" => "pairing_initiate", "error" => "invalid_fields").increment(1);
        return error_response(StatusCode::BAD_REQUEST, "agent_id and agent_name must be 1-128 printable characters");
    }
    let (pairing_code, expires_at) = state.registry.create_pairing(&req.agent_id, &req.agent_name);
    histogram!("credbroker_request_duration_seconds", "endpoint" => "pairing_initiate").record(start.elapsed().as_secs_f64());
    (
        StatusCode::OK,
        Json(PairingInitiateResponse { pairing_code, expires_at }),
    )
        .into_response()
}

#[derive(Deserialize)]
struct PairingExchangeRequest {
    pairing_code: String,
    pake_message: String,
}

async fn pairing_exchange<P, D>(
    State(state): State<Arc<AppState<P, D>>>,
    Json(req): Json<PairingExchangeRequest>,
) -> Response
where
    P: ApprovalPrompter + 'static,
    D: VaultDriver + 'static,
{
    let start = Instant::now();
    counter!("credbroker_requests_total", "endpoint" => "pairing_exchange").increment(1);

    let client_message = match wire::decode(&req.pake_message) {
        Ok(m) => m,
        Err(_) => {
            counter!("credbroker_errors_total", "endpoint" => "pairing_exchange", "error" => "invalid_encoding").increment(1);
            return error_response(StatusCode::BAD_REQUEST, "invalid pake_message encoding");
        }
    };

    match state.registry.exchange(&req.pairing_code, client_message) {
        ExchangeOutcome::Waiting => (StatusCode::ACCEPTED, Json(json!({ "status": "waiting" }))).into_response(),
        ExchangeOutcome::Success {
            session_id,
            server_pake_message,
            agent_id,
        } => {
            gauge!("credbroker_active_sessions").set(state.registry.session_count() as f64);
            histogram!("credbroker_request_duration_seconds", "endpoint" => "pairing_exchange").record(start.elapsed().as_secs_f64());
            (
                StatusCode::OK,
                Json(json!({
                    "session_id": session_id,
                    "pake_message": wire::encode(&server_pake_message),
                    "agent_id": agent_id,
                })),
            )
                .into_response()
        }
        ExchangeOutcome::Rejected(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Deserialize)]
struct CredentialRequest {
    session_id: String,
    encrypted_payload: String,
}

#[derive(Deserialize)]
struct RequestEnvelope {
    domain: String,
    reason: String,
    agent_id: String,
    #[allow(dead_code)]
    agent_name: String,
    timestamp: DateTime<Utc>,
    nonce: String,
}

/// borrows straight out of the decrypted `SecretCell`s: no owned `String`
/// copy of the credential exists between the vault and the ciphertext.
#[derive(Serialize)]
struct ResponseEnvelope<'a> {
    username: &'a str,
    password: &'a str,
    timestamp: DateTime<Utc>,
    nonce: String,
}

async fn credential_request<P, D>(
    State(state): State<Arc<AppState<P, D>>>,
    Json(req): Json<CredentialRequest>,
) -> Response
where
    P: ApprovalPrompter + 'static,
    D: VaultDriver + 'static,
{
    let start = Instant::now();
    counter!("credbroker_requests_total", "endpoint" => "credential_request").increment(1);

    let envelope_bytes = match wire::decode(&req.encrypted_payload) {
        Ok(b) => b,
        Err(_) => {
            counter!("credbroker_errors_total", "endpoint" => "credential_request", "error" => "invalid_encoding").increment(1);
            return error_response(StatusCode::BAD_REQUEST, "invalid encrypted_payload encoding");
        }
    };

    let plaintext = match state.registry.decrypt_for_session(&req.session_id, &envelope_bytes) {
        Ok(p) => p,
        Err(Error::SessionExpired) => {
            counter!("credbroker_errors_total", "endpoint" => "credential_request", "error" => "session_expired").increment(1);
            return error_response(StatusCode::UNAUTHORIZED, "session expired or unknown");
        }
        Err(_) => {
            counter!("credbroker_errors_total", "endpoint" => "credential_request", "error" => "decrypt_failed").increment(1);
            return error_response(StatusCode::BAD_REQUEST, "decrypt failed");
        }
    };

    let env: RequestEnvelope = match serde_json::from_slice(&plaintext) {
        Ok(e) => e,
        Err(_) => {
            counter!("credbroker_errors_total", "endpoint" => "credential_request", "error" => "malformed_envelope").increment(1);
            return error_response(StatusCode::BAD_REQUEST, "malformed request envelope");
        }
    };

    if let Err(e) = state
        .registry
        .check_timestamp_and_nonce(&req.session_id, &env.nonce, env.timestamp)
    {
        counter!("credbroker_errors_total", "endpoint" => "credential_request", "error" => "timestamp_or_nonce").increment(1);
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let metadata = match state.registry.metadata(&req.session_id) {
        Some(m) => m,
        None => {
            counter!("credbroker_errors_total", "endpoint" => "credential_request", "error" => "session_expired").increment(1);
            return error_response(StatusCode::UNAUTHORIZED, "session expired or unknown");
        }
    };

    state
        .audit
        .record(AuditEvent::new(EventKind::Request, &env.agent_id, &env.domain, &env.reason));

    let session_id = req.session_id.clone();
    let domain = env.domain.clone();
    let reason = env.reason.clone();
    let state_for_task = state.clone();
    let metadata_for_task = metadata.clone();
    let decision = match tokio::task::spawn_blocking(move || {
        let is_revoked = || state_for_task.registry.metadata(&session_id).is_none();
        state_for_task
            .dispatcher
            .dispatch(&metadata_for_task, &domain, &reason, is_revoked)
    })
    .await
    {
        Ok(d) => d,
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "approval task failed"),
    };

    let response = match decision {
        Decision::Approve { username, password } => {
            state
                .audit
                .record(AuditEvent::new(EventKind::Approved, &env.agent_id, &env.domain, "approved"));

            let username_bytes = match username.borrow() {
                Ok(b) => b,
                Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "credential buffer already cleared"),
            };
            let password_bytes = match password.borrow() {
                Ok(b) => b,
                Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "credential buffer already cleared"),
            };
            let username_str = match std::str::from_utf8(username_bytes) {
                Ok(s) => s,
                Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "credential is not valid utf-8"),
            };
            let password_str = match std::str::from_utf8(password_bytes) {
                Ok(s) => s,
                Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "credential is not valid utf-8"),
            };

            let body = ResponseEnvelope {
                username: username_str,
                password: password_str,
                timestamp: Utc::now(),
                nonce: env.nonce.clone(),
            };
            let mut plain = match serde_json::to_vec(&body) {
                Ok(p) => p,
                Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "response encoding failed"),
            };
            let encrypted = state.registry.encrypt_for_session(&req.session_id, &plain);
            // the serialized envelope carried the credential in cleartext for
            // the lifetime of this buffer; it no longer needs to exist once
            // encryption has run, successful or not.
            plain.zeroize();

            match encrypted {
                Ok(ciphertext) => {
                    state
                        .audit
                        .record(AuditEvent::new(EventKind::Success, &env.agent_id, &env.domain, "delivered"));
                    counter!("credbroker_credential_requests_total", "status" => "approved").increment(1);
                    (
                        StatusCode::OK,
                        Json(json!({ "status": "approved", "encrypted_payload": wire::encode(&ciphertext) })),
                    )
                        .into_response()
                }
                Err(_) => {
                    state.audit.record(AuditEvent::new(
                        EventKind::Error,
                        &env.agent_id,
                        &env.domain,
                        "session expired before response could be sent",
                    ));
                    counter!("credbroker_credential_requests_total", "status" => "error").increment(1);
                    error_response(StatusCode::UNAUTHORIZED, "session expired before response could be sent")
                }
            }
        }
        Decision::Deny { reason } => {
            state
                .audit
                .record(AuditEvent::new(EventKind::Denied, &env.agent_id, &env.domain, &reason));
            counter!("credbroker_credential_requests_total", "status" => "denied").increment(1);
            (StatusCode::OK, Json(json!({ "status": "denied", "error": reason }))).into_response()
        }
        Decision::Error { kind: ErrorKind::NotFound, detail } => {
            state
                .audit
                .record(AuditEvent::new(EventKind::NotFound, &env.agent_id, &env.domain, &detail));
            counter!("credbroker_credential_requests_total", "status" => "not_found").increment(1);
            (StatusCode::OK, Json(json!({ "status": "not_found", "error": detail }))).into_response()
        }
        Decision::Error { kind, detail } => {
            let event_kind = if kind == ErrorKind::Cancelled { EventKind::Revoked } else { EventKind::Error };
            state.audit.record(AuditEvent::new(event_kind, &env.agent_id, &env.domain, &detail));
            counter!("credbroker_credential_requests_total", "status" => "error").increment(1);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "request could not be completed")
        }
    };

    histogram!("credbroker_request_duration_seconds", "endpoint" => "credential_request").record(start.elapsed().as_secs_f64());
    response
}

#[derive(Deserialize)]
struct SessionRevokeRequest {
    session_id: String,
}

async fn session_revoke<P, D>(
    State(state): State<Arc<AppState<P, D>>>,
    Json(req): Json<SessionRevokeRequest>,
) -> Response
where
    P: ApprovalPrompter + 'static,
    D: VaultDriver + 'static,
{
    counter!("credbroker_requests_total", "endpoint" => "session_revoke").increment(1);
    let revoked = state.registry.revoke(&req.session_id);
    if revoked {
        state.audit.record(AuditEvent::new(EventKind::Revoked, "", "", &req.session_id));
    }
    gauge!("credbroker_active_sessions").set(state.registry.session_count() as f64);
    (StatusCode::OK, Json(json!({ "revoked": true, "session_id": req.session_id }))).into_response()
}

#[derive(Deserialize)]
struct SessionStatusQuery {
    session_id: String,
}

async fn session_status<P, D>(
    State(state): State<Arc<AppState<P, D>>>,
    Query(q): Query<SessionStatusQuery>,
) -> Response
where
    P: ApprovalPrompter + 'static,
    D: VaultDriver + 'static,
{
    counter!("credbroker_requests_total", "endpoint" => "session_status").increment(1);
    match state.registry.metadata(&q.session_id) {
        Some(m) => (
            StatusCode::OK,
            Json(json!({ "active": true, "last_access": m.last_access, "expires_at": m.expires_at })),
        )
            .into_response(),
        None => {
            counter!("credbroker_errors_total", "endpoint" => "session_status", "error" => "not_found").increment(1);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn health<P, D>(State(state): State<Arc<AppState<P, D>>>) -> Response
where
    P: ApprovalPrompter + 'static,
    D: VaultDriver + 'static,
{
    counter!("credbroker_requests_total", "endpoint" => "health").increment(1);
    let active_sessions = state.registry.session_count();
    gauge!("credbroker_active_sessions").set(active_sessions as f64);
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "active_sessions": active_sessions })),
    )
        .into_response()
}
