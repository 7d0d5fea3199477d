//! # Authentication
//!
//! Bearer-token authentication for the admin surface. Every endpoint except
//! the login check validates `Authorization: Bearer <key>` against the
//! configured admin key using a constant-time comparison.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized};

/// Marker type inserted into request extensions once auth succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminAuth;

/// Authentication middleware that validates the bearer token.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    validate_key(&config, token)?;

    let mut request = request;
    request.extensions_mut().insert(AdminAuth);

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))
        .and_then(|value| {
            value
                .to_str()
                .map_err(|_| unauthorized(Some("Invalid Authorization header")))
        })
        .and_then(|header| {
            header
                .strip_prefix("Bearer ")
                .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
        })
}

/// Validates a presented key against the configured admin key.
pub fn validate_key(config: &AppConfig, presented: &str) -> Result<(), ApiError> {
    if config.admin_api_key.is_empty() {
        return Err(unauthorized(Some("Admin API key is not configured")));
    }

    let matches: bool = presented
        .as_bytes()
        .ct_eq(config.admin_api_key.as_bytes())
        .into();

    if matches {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config(key: &str) -> AppConfig {
        AppConfig {
            admin_api_key: key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn missing_header_is_rejected() {
        let headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn non_bearer_scheme_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn key_comparison_accepts_equal_rejects_unequal() {
        assert!(validate_key(&config("s3cret"), "s3cret").is_ok());
        assert!(validate_key(&config("s3cret"), "other").is_err());
        assert!(validate_key(&config(""), "anything").is_err());
    }
}
