//! HTTP Basic auth (§6): constant-time comparison against a single configured
//! username/password, bypassed when `disable_auth` is set.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::AppState;

pub async fn require_basic_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if state.config.disable_auth {
        return next.run(request).await;
    }

    match check_credentials(&headers, &state.config.username, &state.config.password) {
        Ok(()) => next.run(request).await,
        Err(()) => unauthorized(),
    }
}

fn check_credentials(headers: &HeaderMap, expected_user: &str, expected_pass: &str) -> Result<(), ()> {
    let header = headers.get(axum::http::header::AUTHORIZATION).ok_or(())?;
    let header = header.to_str().map_err(|_| ())?;
    let encoded = header.strip_prefix("Basic ").ok_or(())?;
    let decoded = BASE64.decode(encoded).map_err(|_| ())?;
    let decoded = String::from_utf8(decoded).map_err(|_| ())?;
    let (user, pass) = decoded.split_once(':').ok_or(())?;

    if constant_time_eq(user.as_bytes(), expected_user.as_bytes())
        && constant_time_eq(pass.as_bytes(), expected_pass.as_bytes())
    {
        Ok(())
    } else {
        Err(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn unauthorized() -> Response {
    let mut response = StatusCode::UNAUTHORIZED.into_response();
    response.headers_mut().insert(
        axum::http::header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn headers_with_basic_auth(user: &str, pass: &str) -> HeaderMap {
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        headers
    }

    #[test]
    fn accepts_matching_credentials() {
        let headers = headers_with_basic_auth("admin", "admin");
        assert!(check_credentials(&headers, "admin", "admin").is_ok());
    }

    #[test]
    fn rejects_wrong_password() {
        let headers = headers_with_basic_auth("admin", "wrong");
        assert!(check_credentials(&headers, "admin", "admin").is_err());
    }

    #[test]
    fn rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(check_credentials(&headers, "admin", "admin").is_err());
    }

    #[test]
    fn constant_time_eq_requires_equal_length() {
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"same", b"same"));
    }
}
