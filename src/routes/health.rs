//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// How long to wait for the modem I/O thread before reporting it busy. A
/// long-running USSD exchange must not stall the liveness probe.
const STATUS_WAIT: Duration = Duration::from_millis(500);

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, a modem summary, and traffic counters.
/// No authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();

    // The status request queues behind any in-flight operation; if one is
    // running, report the modem as busy rather than blocking the probe.
    let modem = match tokio::time::timeout(STATUS_WAIT, state.modem.status()).await {
        Ok(status) => json!({
            "connected": status.connected,
            "port": status.port,
            "operator": status.operator,
            "signal_percent": status.signal_percent,
        }),
        Err(_) => json!({ "busy": true }),
    };

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "modem": modem,
        "counters": {
            "sms_sent": state.inbox.sent_total.load(Ordering::Relaxed),
            "sms_received": state.inbox.received_total.load(Ordering::Relaxed),
            "ussd_executed": state.inbox.ussd_total.load(Ordering::Relaxed),
        },
    }))
}
