//! Error taxonomy for the gateway.
//!
//! Authentication failures are terminal for a request and carry their own
//! HTTP mapping. Notification failures are only ever logged by the
//! dispatcher.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request is missing signature headers")]
    MissingHeaders,

    #[error("certificate url rejected: {0}")]
    InvalidCertUrl(String),

    #[error("failed to fetch signing certificate: {0}")]
    CertFetchFailed(String),

    #[error("signing certificate is unusable: {0}")]
    MalformedCertificate(String),

    #[error("signature does not match request")]
    InvalidSignature,

    #[error("request timestamp outside the accepted window ({skew_ms} ms)")]
    StaleTimestamp { skew_ms: i64 },
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingHeaders | AuthError::InvalidCertUrl(_) => StatusCode::BAD_REQUEST,
            AuthError::CertFetchFailed(_)
            | AuthError::MalformedCertificate(_)
            | AuthError::InvalidSignature
            | AuthError::StaleTimestamp { .. } => StatusCode::UNAUTHORIZED,
        }
    }

    /// Client-facing reason. Deliberately coarser than `Display`.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingHeaders => "Missing signature headers",
            AuthError::InvalidCertUrl(_) => "Invalid certificate URL",
            AuthError::CertFetchFailed(_) | AuthError::MalformedCertificate(_) => {
                "Signature verification failed"
            }
            AuthError::InvalidSignature => "Invalid signature",
            AuthError::StaleTimestamp { .. } => "Request timestamp too old",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification credentials missing: {}", .0.join(", "))]
    CredentialsMissing(Vec<&'static str>),

    #[error("token request failed: {0}")]
    TokenRequestFailed(String),

    #[error("notification delivery failed: {0}")]
    DeliveryFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_url_problems_are_client_errors() {
        assert_eq!(AuthError::MissingHeaders.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AuthError::InvalidCertUrl("http".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn verification_problems_are_unauthorized() {
        for err in [
            AuthError::CertFetchFailed("timeout".into()),
            AuthError::MalformedCertificate("not pem".into()),
            AuthError::InvalidSignature,
            AuthError::StaleTimestamp { skew_ms: 150_001 },
        ] {
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED, "{err}");
        }
        assert_eq!(
            AuthError::StaleTimestamp { skew_ms: 1 }.reason(),
            "Request timestamp too old"
        );
    }

    #[test]
    fn credentials_missing_lists_names() {
        let err = NotifyError::CredentialsMissing(vec!["client_id", "skill_id"]);
        assert_eq!(
            err.to_string(),
            "notification credentials missing: client_id, skill_id"
        );
    }
}
