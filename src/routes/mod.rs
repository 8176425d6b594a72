//! HTTP route handlers.
//!
//! Handlers contain no protocol logic — they validate the request, call one
//! engine operation through the [`crate::modem::Modem`] handle, and map the
//! result to JSON. All endpoints except [`health`] require authentication
//! via the [`crate::auth::require_api_key`] middleware.

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::error::ModemError;

pub mod health;
pub mod modem;
pub mod ports;
pub mod sms;
pub mod ussd;

/// Map an engine failure to an HTTP response.
///
/// Timeouts (`504`) and device rejections (`502`) are kept distinct because
/// the operator remediation differs: wait and retry versus fix the command
/// or configuration. A missing modem is `503` — the service itself is fine.
pub fn modem_error_response(err: &ModemError) -> (StatusCode, Json<Value>) {
    let status = match err {
        ModemError::NotConnected | ModemError::DeviceNotFound | ModemError::DeviceBusy(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ModemError::CommandTimeout { .. } | ModemError::HandshakeTimeout(_) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::BAD_GATEWAY,
    };

    // Raw device text rides along verbatim so operators can see exactly
    // what the modem said.
    let raw = match err {
        ModemError::CommandRejected { raw, .. }
        | ModemError::CommandTimeout { raw, .. }
        | ModemError::EncodingExhausted { raw } => Some(raw.trim()),
        _ => None,
    };

    (
        status,
        Json(json!({
            "error": err.to_string(),
            "retryable": err.is_timeout(),
            "raw": raw,
        })),
    )
}
