//! Pre-shared API key authentication.
//!
//! Every endpoint except `/api/health` requires an
//! `Authorization: Bearer <key>` header matching `[auth] api_key`.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::AppState;

/// Middleware guarding the authenticated routes. The expected key comes from
/// the shared [`AppState`] via `middleware::from_fn_with_state`.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or not a Bearer scheme
/// - `403 Forbidden` — key present but wrong
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&request) else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
        );
    };
    if !keys_match(state.config.auth.api_key.as_bytes(), token.as_bytes()) {
        return reject(StatusCode::FORBIDDEN, "Invalid API key");
    }
    next.run(request).await
}

/// The token from an `Authorization: Bearer <token>` header, if one is there.
fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Key comparison whose running time depends only on the configured key's
/// length, never on where the first wrong byte sits. The length difference
/// is folded into the same accumulator as the byte diffs.
fn keys_match(expected: &[u8], provided: &[u8]) -> bool {
    let mut mismatch = expected.len() ^ provided.len();
    for (i, &byte) in expected.iter().enumerate() {
        mismatch |= usize::from(byte ^ provided.get(i).copied().unwrap_or_default());
    }
    mismatch == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_match() {
        assert!(keys_match(b"secret", b"secret"));
        assert!(keys_match(b"", b""));
        assert!(!keys_match(b"secret", b"secres"));
        assert!(!keys_match(b"secret", b"secret-longer"));
        assert!(!keys_match(b"secret", b""));
        assert!(!keys_match(b"", b"secret"));
    }
}
