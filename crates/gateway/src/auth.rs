//! Provenance and freshness checks for inbound platform requests.
//!
//! The order of checks matters: header presence and certificate URL shape
//! are verified before any network I/O, and the replay window is enforced
//! after the signature so a correctly signed but old request is still
//! rejected.

use std::sync::Arc;

use axum::http::HeaderMap;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use codelexa_common::Clock;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use crate::cert_cache::CertificateCache;
use crate::config::AuthConfig;
use crate::errors::AuthError;

pub const SIGNATURE_HEADER: &str = "signature";
pub const CERT_CHAIN_URL_HEADER: &str = "signaturecertchainurl";
pub const TIMESTAMP_HEADER: &str = "signature-timestamp";
pub const NONCE_HEADER: &str = "signature-nonce";

/// Everything needed to check one inbound call. Request scoped.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: String,
    pub signature: Option<String>,
    pub cert_chain_url: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub body: Bytes,
    /// Scheme, host, path and query exactly as the platform addressed us.
    pub url: String,
}

impl SignedRequest {
    pub fn from_headers(method: &str, headers: &HeaderMap, url: String, body: Bytes) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Self {
            method: method.to_string(),
            signature: header(SIGNATURE_HEADER),
            cert_chain_url: header(CERT_CHAIN_URL_HEADER),
            timestamp: header(TIMESTAMP_HEADER),
            nonce: header(NONCE_HEADER),
            body,
            url,
        }
    }
}

pub struct RequestAuthenticator {
    config: AuthConfig,
    certificates: CertificateCache,
    clock: Arc<dyn Clock>,
}

impl RequestAuthenticator {
    pub fn new(config: AuthConfig, certificates: CertificateCache, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            certificates,
            clock,
        }
    }

    pub async fn authenticate(&self, request: &SignedRequest) -> Result<(), AuthError> {
        let result = self.check(request).await;
        if let Err(err) = &result {
            warn!(error = %err, url = %request.url, "rejected inbound request");
        }
        result
    }

    async fn check(&self, request: &SignedRequest) -> Result<(), AuthError> {
        let (Some(signature), Some(cert_url), Some(timestamp), Some(nonce)) = (
            request.signature.as_deref(),
            request.cert_chain_url.as_deref(),
            request.timestamp.as_deref(),
            request.nonce.as_deref(),
        ) else {
            return Err(AuthError::MissingHeaders);
        };

        validate_cert_url(cert_url, &self.config)?;

        let pem = self
            .certificates
            .get_or_fetch(cert_url)
            .await
            .map_err(|err| AuthError::CertFetchFailed(format!("{err:#}")))?;

        let message = string_to_sign(&request.method, &request.body, timestamp, nonce, &request.url);
        verify_signature(&pem, signature, &message)?;

        let skew_ms = match parse_timestamp(timestamp) {
            Some(sent_at) => (self.clock.now() - sent_at).num_milliseconds().abs(),
            None => i64::MAX,
        };
        if skew_ms > self.config.max_skew_ms {
            return Err(AuthError::StaleTimestamp { skew_ms });
        }

        debug!(url = %request.url, skew_ms, "request authenticated");
        Ok(())
    }
}

/// Only https URLs on the platform host under its certificate directory are
/// acceptable. The path is checked after normalisation so `..` segments
/// cannot climb out of the directory.
pub fn validate_cert_url(raw: &str, config: &AuthConfig) -> Result<Url, AuthError> {
    let url = Url::parse(raw).map_err(|err| AuthError::InvalidCertUrl(format!("{raw}: {err}")))?;

    if url.scheme() != "https" {
        return Err(AuthError::InvalidCertUrl(format!(
            "scheme '{}' is not https",
            url.scheme()
        )));
    }

    let host_ok = url
        .host_str()
        .is_some_and(|host| host.eq_ignore_ascii_case(&config.cert_host));
    if !host_ok {
        return Err(AuthError::InvalidCertUrl(format!(
            "host '{}' is not {}",
            url.host_str().unwrap_or_default(),
            config.cert_host
        )));
    }

    if !url.path().starts_with(&config.cert_path_prefix) {
        return Err(AuthError::InvalidCertUrl(format!(
            "path '{}' is outside {}",
            url.path(),
            config.cert_path_prefix
        )));
    }

    Ok(url)
}

/// `METHOD \n base64(sha256(body)) \n timestamp \n nonce \n url`
pub fn string_to_sign(method: &str, body: &[u8], timestamp: &str, nonce: &str, url: &str) -> String {
    let body_digest = general_purpose::STANDARD.encode(Sha256::digest(body));
    format!("{method}\n{body_digest}\n{timestamp}\n{nonce}\n{url}")
}

/// Check a base64 RSA PKCS#1 v1.5 / SHA-256 signature against the first
/// certificate of a PEM chain.
pub fn verify_signature(pem: &str, signature_b64: &str, message: &str) -> Result<(), AuthError> {
    let public_key = public_key_from_pem(pem)?;

    let raw_signature = general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidSignature)?;
    let signature =
        Signature::try_from(raw_signature.as_slice()).map_err(|_| AuthError::InvalidSignature)?;

    VerifyingKey::<Sha256>::new(public_key)
        .verify(message.as_bytes(), &signature)
        .map_err(|_| AuthError::InvalidSignature)
}

fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, AuthError> {
    let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|err| AuthError::MalformedCertificate(format!("pem: {err}")))?;
    let certificate = block
        .parse_x509()
        .map_err(|err| AuthError::MalformedCertificate(format!("x509: {err}")))?;
    RsaPublicKey::from_public_key_der(certificate.public_key().raw)
        .map_err(|err| AuthError::MalformedCertificate(format!("public key: {err}")))
}

/// Accepts RFC 3339 (what the platform sends) or integral epoch milliseconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis);
    }
    None
}
