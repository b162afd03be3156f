//! Static bearer authentication and registration settings.

use axum::{
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
    },
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_RESEND_COOLDOWN_SECONDS: u64 = 60;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    api_token: SecretString,
    base_url: String,
    resend_cooldown: Duration,
}

impl AuthConfig {
    #[must_use]
    pub fn new(api_token: SecretString) -> Self {
        Self {
            api_token,
            base_url: DEFAULT_BASE_URL.to_string(),
            resend_cooldown: Duration::from_secs(DEFAULT_RESEND_COOLDOWN_SECONDS),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: u64) -> Self {
        self.resend_cooldown = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn resend_cooldown(&self) -> Duration {
        self.resend_cooldown
    }

    /// Link mailed to the user; visiting it consumes `token`.
    #[must_use]
    pub fn verify_url(&self, token: &str) -> String {
        format!("{}/verify-email/{token}", self.base_url.trim_end_matches('/'))
    }

    fn accepts(&self, token: &str) -> bool {
        // Digests, not raw tokens, are compared.
        Sha256::digest(token.as_bytes()) == Sha256::digest(self.api_token.expose_secret().as_bytes())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BearerError {
    #[error("no bearer token in the Authorization header")]
    Missing,
    #[error("bearer token does not match")]
    Invalid,
}

/// Check `Authorization: Bearer <token>` against the configured API token.
///
/// # Errors
/// `Missing` without a bearer header, `Invalid` when the token does not match.
pub fn require_bearer(headers: &HeaderMap, config: &AuthConfig) -> Result<(), BearerError> {
    let Some(token) = extract_bearer(headers) else {
        return Err(BearerError::Missing);
    };

    if config.accepts(token) {
        Ok(())
    } else {
        Err(BearerError::Invalid)
    }
}

/// 401 with a `WWW-Authenticate: Bearer` challenge. The body is the same for
/// both causes; only the log tells them apart.
#[must_use]
pub fn unauthorized(err: &BearerError) -> Response {
    debug!("Rejected API request: {err}");
    let mut response = (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_TOKEN: &str = "test-api-token";

    pub(crate) fn auth_config() -> AuthConfig {
        AuthConfig::new(SecretString::from(TEST_TOKEN.to_string()))
    }

    pub(crate) fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    #[test]
    fn require_bearer_accepts_matching_token() {
        let config = auth_config();
        assert_eq!(require_bearer(&bearer_headers(TEST_TOKEN), &config), Ok(()));
    }

    #[test]
    fn require_bearer_rejects_missing_or_wrong() {
        let config = auth_config();
        assert_eq!(
            require_bearer(&HeaderMap::new(), &config),
            Err(BearerError::Missing)
        );
        assert_eq!(
            require_bearer(&bearer_headers("nope"), &config),
            Err(BearerError::Invalid)
        );

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(require_bearer(&headers, &config), Err(BearerError::Missing));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer    "));
        assert_eq!(require_bearer(&headers, &config), Err(BearerError::Missing));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("bearer test-api-token"),
        );
        assert_eq!(require_bearer(&headers, &auth_config()), Ok(()));
    }

    #[tokio::test]
    async fn unauthorized_sets_challenge_for_either_cause() -> anyhow::Result<()> {
        for err in [BearerError::Missing, BearerError::Invalid] {
            let response = unauthorized(&err);
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                response.headers().get(WWW_AUTHENTICATE),
                Some(&HeaderValue::from_static("Bearer"))
            );
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
            assert_eq!(&body[..], b"Invalid token");
        }
        Ok(())
    }

    #[test]
    fn bearer_error_names_the_cause() {
        assert_eq!(
            BearerError::Missing.to_string(),
            "no bearer token in the Authorization header"
        );
        assert_eq!(BearerError::Invalid.to_string(), "bearer token does not match");
    }

    #[test]
    fn verify_url_joins_base() {
        let config = auth_config().with_base_url("https://api.zerowork.dev/".to_string());
        assert_eq!(
            config.verify_url("abc"),
            "https://api.zerowork.dev/verify-email/abc"
        );
        assert_eq!(auth_config().resend_cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn debug_redacts_token() {
        assert!(!format!("{:?}", auth_config()).contains(TEST_TOKEN));
    }
}
