//! Serial port diagnostics endpoints.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::discover;
use crate::AppState;

/// `GET /api/ports` — enumerate serial devices visible to the OS.
pub async fn list() -> Json<Value> {
    // Enumeration only — nothing is opened, but the OS calls still block.
    let ports = tokio::task::spawn_blocking(discover::list_ports)
        .await
        .unwrap_or_default();
    Json(json!({
        "count": ports.len(),
        "ports": ports,
    }))
}

/// `GET /api/ports/diagnostics` — probe every enumerated port and report
/// one row per device: classification, raw `AT`/`ATI` replies, and any
/// open error. The rows feed an external CSV export.
///
/// Runs on the modem I/O thread so probing can never race a live exchange;
/// the held port is health-checked through the existing session.
pub async fn diagnostics(State(state): State<AppState>) -> Json<Value> {
    let rows: Vec<Value> = state
        .modem
        .diagnostics()
        .await
        .into_iter()
        .map(|r| {
            json!({
                "port": r.endpoint.path,
                "description": r.description,
                "status": r.status,
                "at_reply": r.at_reply,
                "ati_reply": r.ati_reply,
                "error": r.error,
            })
        })
        .collect();
    Json(json!({
        "count": rows.len(),
        "results": rows,
    }))
}
