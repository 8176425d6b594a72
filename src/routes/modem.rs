//! Modem status and reconnect endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::modem::ModemStatus;
use crate::routes::modem_error_response;
use crate::AppState;

/// `GET /api/modem` — full modem status: port, operator, signal, SMSC, and
/// device identity. Signal and operator are refreshed from the device.
pub async fn status(State(state): State<AppState>) -> Json<ModemStatus> {
    Json(state.modem.status().await)
}

/// `POST /api/modem/reconnect` — tear down the current link, rediscover,
/// and connect again. The winning port may differ from the previous one.
///
/// # Errors
///
/// - `503 Service Unavailable` — no functional modem found on any port
/// - `504 Gateway Timeout` — a modem answered the probe but not the handshake
pub async fn reconnect(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.modem.reconnect().await {
        Ok(status) => Ok(Json(json!({
            "reconnected": true,
            "port": status.port,
            "operator": status.operator,
            "signal_percent": status.signal_percent,
        }))),
        Err(e) => Err(modem_error_response(&e)),
    }
}
