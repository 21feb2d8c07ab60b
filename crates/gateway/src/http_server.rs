use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::Extension,
    http::{header::HOST, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::{
    auth::{RequestAuthenticator, SignedRequest},
    errors::AuthError,
    health::HealthReporter,
    skill::SkillHandler,
};

pub const WEBHOOK_PATH: &str = "/alexa";
pub const HEALTH_PATH: &str = "/alexa/health";

#[derive(Clone)]
pub struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    authenticator: RequestAuthenticator,
    skill: SkillHandler,
    health: HealthReporter,
    public_base_url: Option<String>,
}

impl HttpState {
    pub fn new(
        authenticator: RequestAuthenticator,
        skill: SkillHandler,
        health: HealthReporter,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(HttpStateInner {
                authenticator,
                skill,
                health,
                public_base_url: public_base_url
                    .map(|base| base.trim_end_matches('/').to_string())
                    .filter(|base| !base.is_empty()),
            }),
        }
    }

    /// The URL the platform signed: the configured public base when present,
    /// otherwise rebuilt from the forwarding headers.
    fn signed_url(&self, headers: &HeaderMap, uri: &Uri) -> String {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());

        let base = self
            .inner
            .public_base_url
            .clone()
            .or_else(|| derive_base_url(headers))
            .unwrap_or_default();

        format!("{base}{path_and_query}")
    }
}

#[derive(Debug)]
enum ApiError {
    Auth(AuthError),
    Internal(anyhow::Error),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(err) => {
                (err.status_code(), Json(json!({ "error": err.reason() }))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!("health report failed: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": format!("{err:#}") })),
                )
                    .into_response()
            }
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(handle_webhook))
        .route(HEALTH_PATH, get(health))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn run_http_server(state: HttpState, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid bind address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind voice gateway to {addr}"))?;

    tracing::info!("voice gateway listening on {addr}{WEBHOOK_PATH}");

    axum::serve(listener, router(state).into_make_service())
        .await
        .context("voice gateway encountered an unrecoverable error")?;

    Ok(())
}

async fn handle_webhook(
    Extension(state): Extension<HttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let url = state.signed_url(&headers, &uri);
    let request = SignedRequest::from_headers(method.as_str(), &headers, url, body);

    state.inner.authenticator.authenticate(&request).await?;

    let response = state.inner.skill.handle(&request.body);
    Ok((StatusCode::OK, Json(response)).into_response())
}

async fn health(Extension(state): Extension<HttpState>) -> Result<Response, ApiError> {
    let report = tokio::task::spawn_blocking(move || state.inner.health.report())
        .await
        .map_err(|err| ApiError::Internal(err.into()))?
        .map_err(ApiError::Internal)?;

    Ok((StatusCode::OK, Json(report)).into_response())
}

fn derive_base_url(headers: &HeaderMap) -> Option<String> {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())?;

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("https");

    Some(format!("{scheme}://{host}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn base_url_defaults_to_https() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("voice.example.com"));
        assert_eq!(
            derive_base_url(&headers).as_deref(),
            Some("https://voice.example.com")
        );

        headers.insert("x-forwarded-proto", HeaderValue::from_static("http, https"));
        assert_eq!(
            derive_base_url(&headers).as_deref(),
            Some("http://voice.example.com")
        );
    }

    #[test]
    fn base_url_requires_host() {
        assert!(derive_base_url(&HeaderMap::new()).is_none());
    }
}
