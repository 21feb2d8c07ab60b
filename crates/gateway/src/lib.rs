//! Voice-assistant gateway: authenticates signed platform webhooks, hands
//! spoken tasks to an external runner, and reports back through proactive
//! notifications.

pub mod auth;
pub mod cert_cache;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod http_server;
pub mod notifications;
pub mod skill;
pub mod status_store;

use std::sync::Arc;

use codelexa_common::Clock;
use reqwest::Client;

use crate::auth::RequestAuthenticator;
use crate::cert_cache::{CertificateCache, CertificateSource, HttpCertificateSource};
use crate::config::GatewayConfig;
use crate::dispatcher::TaskDispatcher;
use crate::health::HealthReporter;
use crate::http_server::HttpState;
use crate::notifications::{NotificationClient, Notifier};
use crate::skill::SkillHandler;
use crate::status_store::StatusStore;

pub use crate::config::{CliOptions, FileConfig};
pub use crate::http_server::{router, run_http_server};

/// Wire the gateway against the real platform endpoints.
pub fn build_gateway(config: &GatewayConfig, http: Client, clock: Arc<dyn Clock>) -> HttpState {
    let certificates = Arc::new(HttpCertificateSource::new(http.clone()));
    let notifier = Arc::new(NotificationClient::new(
        http,
        config.notifications.clone(),
        Arc::clone(&clock),
    ));
    assemble(config, certificates, notifier, clock)
}

/// Wire the gateway around caller-supplied outbound edges.
pub fn assemble(
    config: &GatewayConfig,
    certificates: Arc<dyn CertificateSource>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
) -> HttpState {
    let cache = CertificateCache::new(certificates, Arc::clone(&clock), config.auth.cert_ttl);
    let authenticator = RequestAuthenticator::new(config.auth.clone(), cache, Arc::clone(&clock));

    let store = StatusStore::new(config.status_path.clone());
    let dispatcher = Arc::new(TaskDispatcher::new(
        config.worker.clone(),
        store.clone(),
        notifier,
        Arc::clone(&clock),
    ));
    let health = HealthReporter::new(
        config.worker.clone(),
        config.notifications.credentials.clone(),
        store,
        clock,
    );

    HttpState::new(
        authenticator,
        SkillHandler::new(dispatcher),
        health,
        config.server.public_base_url.clone(),
    )
}
