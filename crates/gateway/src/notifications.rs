//! Proactive completion notices through the platform's messaging API.
//!
//! Each notice performs a client-credentials token grant followed by one
//! push. Tokens are not cached between notices.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use codelexa_common::Clock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{NotificationConfig, NotificationCredentials};
use crate::errors::NotifyError;

const EVENT_NAME: &str = "AMAZON.MessageAlert.Activated";
const EXPIRY_HOURS: i64 = 24;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const BODY_SNIPPET_LIMIT: usize = 300;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

pub struct NotificationClient {
    http: Client,
    config: NotificationConfig,
    clock: Arc<dyn Clock>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

impl NotificationClient {
    pub fn new(http: Client, config: NotificationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            config,
            clock,
        }
    }

    pub fn credentials(&self) -> &NotificationCredentials {
        &self.config.credentials
    }

    pub async fn fetch_token(&self) -> Result<String, NotifyError> {
        let (client_id, client_secret) = match &self.config.credentials {
            NotificationCredentials::Configured {
                client_id,
                client_secret,
                ..
            } => (client_id, client_secret),
            NotificationCredentials::Unconfigured { missing } => {
                return Err(NotifyError::CredentialsMissing(missing.clone()));
            }
        };

        let form = [
            ("grant_type", "client_credentials"),
            ("scope", self.config.scope.as_str()),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| NotifyError::TokenRequestFailed(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| NotifyError::TokenRequestFailed(err.to_string()))?;
        if !status.is_success() {
            return Err(NotifyError::TokenRequestFailed(format!(
                "{status}: {}",
                snippet(&body)
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| NotifyError::TokenRequestFailed(format!("unparsable response: {err}")))?;
        parsed
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| NotifyError::TokenRequestFailed("response carried no access_token".into()))
    }

    pub async fn push(&self, token: &str, skill_id: &str, message: &str) -> Result<(), NotifyError> {
        let url = self.config.messaging_url.replace("{skill_id}", skill_id);
        let event = self.build_event(message);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&event)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| NotifyError::DeliveryFailed(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(reference_id = %event["referenceId"], "notification accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::DeliveryFailed(format!("{status}: {}", snippet(&body))))
    }

    fn build_event(&self, message: &str) -> Value {
        let now = self.clock.now();
        let expires = now + chrono::Duration::hours(EXPIRY_HOURS);
        let text = if message.trim().is_empty() {
            format!("{} finished a task.", self.config.sender_name)
        } else {
            message.to_string()
        };

        json!({
            "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "referenceId": format!("codex-{}", Uuid::new_v4()),
            "expiryTime": expires.to_rfc3339_opts(SecondsFormat::Millis, true),
            "event": {
                "name": EVENT_NAME,
                "payload": {
                    "state": {
                        "status": "UNREAD",
                        "freshness": "NEW"
                    },
                    "messageGroup": {
                        "creator": { "name": self.config.sender_name },
                        "count": 1
                    }
                }
            },
            "localizedAttributes": [
                {
                    "locale": self.config.locale,
                    "message": text
                }
            ],
            "relevantAudience": {
                "type": "Multicast"
            }
        })
    }
}

#[async_trait]
impl Notifier for NotificationClient {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let skill_id = match &self.config.credentials {
            NotificationCredentials::Configured { skill_id, .. } => skill_id.clone(),
            NotificationCredentials::Unconfigured { missing } => {
                return Err(NotifyError::CredentialsMissing(missing.clone()));
            }
        };

        let token = self.fetch_token().await?;
        self.push(&token, &skill_id, message).await?;
        info!("completion notice delivered");
        Ok(())
    }
}

fn snippet(body: &str) -> &str {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_SNIPPET_LIMIT {
        return trimmed;
    }
    let mut end = BODY_SNIPPET_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    &trimmed[..end]
}
