//! Pre-shared bearer key authentication.
//!
//! Operator routes require `Authorization: Bearer <api_key>`; beacon routes
//! require the separate beacon key. `/api/health` is public. Each key reaches
//! its middleware as a router extension, so handlers never see it.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected operator key, injected as an extension on operator routes.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Expected beacon key, injected as an extension on beacon routes.
#[derive(Clone)]
pub struct BeaconKey(pub String);

/// Rejects operator requests without a valid bearer key.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: key present but invalid
/// - `500 Internal Server Error`: [`ApiKey`] extension not found
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let expected = request.extensions().get::<ApiKey>().map(|k| k.0.clone());
    match check_bearer(expected.as_deref(), &request) {
        Ok(()) => next.run(request).await,
        Err(resp) => resp,
    }
}

/// Same contract as [`require_api_key`], against [`BeaconKey`].
pub async fn require_beacon_key(request: Request, next: Next) -> Response {
    let expected = request.extensions().get::<BeaconKey>().map(|k| k.0.clone());
    match check_bearer(expected.as_deref(), &request) {
        Ok(()) => next.run(request).await,
        Err(resp) => resp,
    }
}

fn check_bearer(expected: Option<&str>, request: &Request) -> Result<(), Response> {
    let Some(expected) = expected else {
        return Err(reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error",
            "CONFIG_ERROR",
        ));
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| {
            reject(
                StatusCode::UNAUTHORIZED,
                "Missing or invalid Authorization header",
                "UNAUTHORIZED",
            )
        })?;

    if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        Ok(())
    } else {
        Err(reject(StatusCode::FORBIDDEN, "Invalid key", "FORBIDDEN"))
    }
}

fn reject(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(json!({"error": message, "code": code}))).into_response()
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so response time does not reveal the key length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_cases() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b""));
    }
}
