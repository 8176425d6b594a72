//! USSD endpoints: execute, cancel, capability probe.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::patterns;
use crate::routes::modem_error_response;
use crate::AppState;

/// Default overall deadline for one USSD exchange.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Upper bound on the caller-supplied timeout.
const MAX_TIMEOUT_SECS: u64 = 120;

/// Request body for `POST /api/ussd`.
#[derive(Deserialize)]
pub struct UssdRequest {
    /// Dialable code, e.g. `*125#` or `*150*841112233#`.
    pub code: String,
    /// Overall deadline in seconds (default 30, capped at 120).
    pub timeout_secs: Option<u64>,
}

/// `POST /api/ussd` — execute one USSD exchange.
///
/// Returns the decoded reply text, the network's result status
/// (`1` means the session expects a follow-up), and the raw reply.
///
/// # Errors
///
/// - `400 Bad Request` — the code is not a dialable USSD shape
/// - `502 Bad Gateway` — every request encoding was rejected
/// - `503 Service Unavailable` — no modem connected
/// - `504 Gateway Timeout` — no recognizable reply before the deadline
pub async fn execute(
    State(state): State<AppState>,
    Json(payload): Json<UssdRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let code = payload.code.trim();
    if !patterns::USSD_CODE.is_match(code) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("not a USSD code: {code:?}")})),
        ));
    }

    let timeout = Duration::from_secs(
        payload
            .timeout_secs
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS),
    );

    match state.modem.execute_ussd(code, timeout).await {
        Ok(exchange) => {
            state.inbox.ussd_total.fetch_add(1, Ordering::Relaxed);
            Ok(Json(json!({
                "code": exchange.code,
                "encoding": exchange.encoding,
                "status": exchange.status,
                "session_active": exchange.session_active(),
                "text": exchange.text,
                "raw": exchange.raw,
            })))
        }
        Err(e) => Err(modem_error_response(&e)),
    }
}

/// Request body for `POST /api/ussd/reply`.
#[derive(Deserialize)]
pub struct UssdReplyRequest {
    /// Follow-up text for the active session, typically a menu digit.
    pub reply: String,
    /// Overall deadline in seconds (default 30, capped at 120).
    pub timeout_secs: Option<u64>,
}

/// `POST /api/ussd/reply` — continue an active USSD session.
///
/// Only meaningful after an exchange whose `session_active` was true; the
/// session is not cancelled first.
///
/// # Errors
///
/// - `400 Bad Request` — empty reply text
/// - `502 Bad Gateway` — every request encoding was rejected
/// - `503 Service Unavailable` — no modem connected
/// - `504 Gateway Timeout` — no recognizable reply before the deadline
pub async fn reply(
    State(state): State<AppState>,
    Json(payload): Json<UssdReplyRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let text = payload.reply.trim();
    if text.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "'reply' must be non-empty"})),
        ));
    }

    let timeout = Duration::from_secs(
        payload
            .timeout_secs
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS),
    );

    match state.modem.continue_ussd(text, timeout).await {
        Ok(exchange) => Ok(Json(json!({
            "code": exchange.code,
            "encoding": exchange.encoding,
            "status": exchange.status,
            "session_active": exchange.session_active(),
            "text": exchange.text,
            "raw": exchange.raw,
        }))),
        Err(e) => Err(modem_error_response(&e)),
    }
}

/// `DELETE /api/ussd` — cancel any active USSD session.
///
/// # Errors
///
/// - `503 Service Unavailable` — no modem connected
pub async fn cancel(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.modem.cancel_ussd().await {
        Ok(cancelled) => Ok(Json(json!({ "cancelled": cancelled }))),
        Err(e) => Err(modem_error_response(&e)),
    }
}

/// `GET /api/ussd/support` — whether the modem advertises the CUSD command
/// set at all.
///
/// # Errors
///
/// - `503 Service Unavailable` — no modem connected
pub async fn support(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.modem.ussd_supported().await {
        Ok(supported) => Ok(Json(json!({ "supported": supported }))),
        Err(e) => Err(modem_error_response(&e)),
    }
}
