//! SMS endpoints: send, inbox read, recent messages.

use std::sync::atomic::Ordering;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::routes::modem_error_response;
use crate::AppState;

/// Request body for `POST /api/sms`.
#[derive(Deserialize)]
pub struct SendSmsRequest {
    /// Destination number. Local 9-digit numbers get the configured country
    /// prefix; anything else is used after digit normalization.
    pub to: String,
    /// Message text (text-mode SMS, single part).
    pub body: String,
}

/// `POST /api/sms` — send one text message.
///
/// # Errors
///
/// - `400 Bad Request` — empty destination or body
/// - `502 Bad Gateway` — the modem rejected the send (raw reply included)
/// - `503 Service Unavailable` — no modem connected
/// - `504 Gateway Timeout` — no network confirmation before the deadline
pub async fn send(
    State(state): State<AppState>,
    Json(payload): Json<SendSmsRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if payload.to.trim().is_empty() || payload.body.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "'to' and 'body' must be non-empty"})),
        ));
    }

    match state.modem.send_sms(&payload.to, &payload.body).await {
        Ok(receipt) => {
            state.inbox.sent_total.fetch_add(1, Ordering::Relaxed);
            Ok(Json(json!({ "message_id": receipt.message_id })))
        }
        Err(e) => Err(modem_error_response(&e)),
    }
}

/// Query parameters for `GET /api/sms/inbox`.
#[derive(Deserialize)]
pub struct InboxQuery {
    /// Delete each message from SIM storage after a successful parse.
    /// Defaults to false — the background poller owns routine cleanup.
    #[serde(default)]
    pub delete: bool,
}

/// `GET /api/sms/inbox` — read every message currently in SIM storage.
///
/// # Errors
///
/// - `503 Service Unavailable` — no modem connected
pub async fn inbox(
    State(state): State<AppState>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.modem.read_inbox(query.delete).await {
        Ok(messages) => Ok(Json(json!({
            "count": messages.len(),
            "messages": messages,
        }))),
        Err(e) => Err(modem_error_response(&e)),
    }
}

/// `GET /api/sms/recent` — the most recent inbound messages collected by
/// the background poller, oldest first.
pub async fn recent(State(state): State<AppState>) -> Json<Value> {
    let messages = state.inbox.recent().await;
    Json(json!({
        "count": messages.len(),
        "messages": messages,
        "received_total": state.inbox.received_total.load(Ordering::Relaxed),
    }))
}
