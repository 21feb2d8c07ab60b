use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 4090;
pub const DEFAULT_CERT_HOST: &str = "s3.amazonaws.com";
pub const DEFAULT_CERT_PATH_PREFIX: &str = "/echo.api/";
pub const DEFAULT_MAX_SKEW_MS: i64 = 150_000;
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_RUNNER: &str = "~/bin/codex-task-runner.py";
pub const DEFAULT_STATUS_FILE: &str = "~/.codex/codelexa-status.json";
pub const DEFAULT_TOKEN_URL: &str = "https://api.amazon.com/auth/o2/token";
pub const DEFAULT_MESSAGING_URL: &str = "https://api.amazonalexa.com/v1/skillMessaging";
pub const DEFAULT_SCOPE: &str = "alexa::devices:all:notifications:write";
pub const DEFAULT_LOCALE: &str = "en-US";
pub const DEFAULT_SENDER: &str = "Codex";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub worker: WorkerConfig,
    pub status_path: PathBuf,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally visible origin (`https://host[:port]`) used to rebuild the
    /// signed request URL when the gateway sits behind a proxy.
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub cert_host: String,
    pub cert_path_prefix: String,
    pub max_skew_ms: i64,
    pub cert_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cert_host: DEFAULT_CERT_HOST.to_string(),
            cert_path_prefix: DEFAULT_CERT_PATH_PREFIX.to_string(),
            max_skew_ms: DEFAULT_MAX_SKEW_MS,
            cert_ttl: DEFAULT_CERT_TTL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub runner: PathBuf,
    /// Program used to launch `runner`; `None` executes the runner directly.
    pub interpreter: Option<String>,
    pub args: Vec<String>,
    /// Upper bound on simultaneously running workers; `None` is unbounded.
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub credentials: NotificationCredentials,
    pub token_url: String,
    /// May contain a `{skill_id}` placeholder.
    pub messaging_url: String,
    pub scope: String,
    pub locale: String,
    pub sender_name: String,
}

impl NotificationConfig {
    pub fn new(credentials: NotificationCredentials) -> Self {
        Self {
            credentials,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            messaging_url: DEFAULT_MESSAGING_URL.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            locale: DEFAULT_LOCALE.to_string(),
            sender_name: DEFAULT_SENDER.to_string(),
        }
    }
}

/// Outcome of validating the notification secrets at startup.
#[derive(Clone, PartialEq, Eq)]
pub enum NotificationCredentials {
    Configured {
        client_id: String,
        client_secret: String,
        skill_id: String,
    },
    Unconfigured {
        missing: Vec<&'static str>,
    },
}

impl NotificationCredentials {
    pub fn from_parts(
        client_id: Option<String>,
        client_secret: Option<String>,
        skill_id: Option<String>,
    ) -> Self {
        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        match (present(client_id), present(client_secret), present(skill_id)) {
            (Some(client_id), Some(client_secret), Some(skill_id)) => Self::Configured {
                client_id,
                client_secret,
                skill_id,
            },
            (id, secret, skill) => {
                let mut missing = Vec::new();
                if id.is_none() {
                    missing.push("client_id");
                }
                if secret.is_none() {
                    missing.push("client_secret");
                }
                if skill.is_none() {
                    missing.push("skill_id");
                }
                Self::Unconfigured { missing }
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured { .. })
    }

    pub fn missing(&self) -> &[&'static str] {
        match self {
            Self::Configured { .. } => &[],
            Self::Unconfigured { missing } => missing,
        }
    }
}

// Hand-written so the client secret never reaches a log line.
impl std::fmt::Debug for NotificationCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configured {
                client_id,
                skill_id,
                ..
            } => f
                .debug_struct("Configured")
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .field("skill_id", skill_id)
                .finish(),
            Self::Unconfigured { missing } => f
                .debug_struct("Unconfigured")
                .field("missing", missing)
                .finish(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CliOptions {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub runner: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub public_base_url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: FileServerSection,
    pub auth: FileAuthSection,
    pub worker: FileWorkerSection,
    pub status: FileStatusSection,
    pub notifications: FileNotificationSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub public_base_url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileAuthSection {
    pub cert_host: Option<String>,
    pub cert_path_prefix: Option<String>,
    pub max_skew_ms: Option<i64>,
    pub cert_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileWorkerSection {
    pub runner: Option<String>,
    pub interpreter: Option<String>,
    pub args: Option<Vec<String>>,
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileStatusSection {
    pub path: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileNotificationSection {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub skill_id: Option<String>,
    pub token_url: Option<String>,
    pub messaging_url: Option<String>,
    pub scope: Option<String>,
    pub locale: Option<String>,
    pub sender_name: Option<String>,
}

/// Read the TOML config. A missing file is not an error.
pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        tracing::debug!("config file {} not found, using defaults", path.display());
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let parsed: FileConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;
    Ok(Some(parsed))
}

/// Merge CLI, environment, file and defaults, in that order of precedence.
pub fn resolve<E>(cli: &CliOptions, file: Option<&FileConfig>, env: E) -> Result<GatewayConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());
    let home = env("HOME").map(PathBuf::from);
    let default_file = FileConfig::default();
    let file = file.unwrap_or(&default_file);

    let host = cli
        .host
        .clone()
        .or_else(|| env("CODELEXA_HOST"))
        .or_else(|| file.server.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let env_port = env("CODELEXA_PORT")
        .map(|raw| {
            raw.trim()
                .parse::<u16>()
                .map_err(|err| anyhow!("Invalid CODELEXA_PORT value '{}': {}", raw, err))
        })
        .transpose()?;
    let port = cli
        .port
        .or(env_port)
        .or(file.server.port)
        .unwrap_or(DEFAULT_PORT);

    let public_base_url = cli
        .public_base_url
        .clone()
        .or_else(|| env("CODELEXA_PUBLIC_BASE_URL"))
        .or_else(|| file.server.public_base_url.clone())
        .map(|url| url.trim_end_matches('/').to_string());

    let auth = AuthConfig {
        cert_host: file
            .auth
            .cert_host
            .clone()
            .unwrap_or_else(|| DEFAULT_CERT_HOST.to_string()),
        cert_path_prefix: file
            .auth
            .cert_path_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_CERT_PATH_PREFIX.to_string()),
        max_skew_ms: file.auth.max_skew_ms.unwrap_or(DEFAULT_MAX_SKEW_MS),
        cert_ttl: file
            .auth
            .cert_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CERT_TTL),
    };

    let runner = cli
        .runner
        .clone()
        .or_else(|| env("CODELEXA_RUNNER").map(PathBuf::from))
        .or_else(|| file.worker.runner.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNNER));

    // An explicitly empty interpreter means "exec the runner directly".
    let interpreter = match file.worker.interpreter.as_deref() {
        Some(value) if value.trim().is_empty() => None,
        Some(value) => Some(value.trim().to_string()),
        None => Some(DEFAULT_INTERPRETER.to_string()),
    };

    let worker = WorkerConfig {
        runner: expand_tilde(runner, home.as_deref()),
        interpreter,
        args: file.worker.args.clone().unwrap_or_default(),
        max_concurrent: file.worker.max_concurrent.filter(|limit| *limit > 0),
    };

    let status_path = cli
        .status_file
        .clone()
        .or_else(|| env("CODELEXA_STATUS_FILE").map(PathBuf::from))
        .or_else(|| file.status.path.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATUS_FILE));

    let section = &file.notifications;
    let credentials = NotificationCredentials::from_parts(
        env("ALEXA_CLIENT_ID").or_else(|| section.client_id.clone()),
        env("ALEXA_CLIENT_SECRET").or_else(|| section.client_secret.clone()),
        env("ALEXA_SKILL_ID").or_else(|| section.skill_id.clone()),
    );
    if let NotificationCredentials::Unconfigured { missing } = &credentials {
        tracing::warn!(
            missing = ?missing,
            "notification credentials incomplete; completion notices are disabled"
        );
    }

    let notifications = NotificationConfig {
        credentials,
        token_url: section
            .token_url
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
        messaging_url: section
            .messaging_url
            .clone()
            .unwrap_or_else(|| DEFAULT_MESSAGING_URL.to_string()),
        scope: section
            .scope
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        locale: section
            .locale
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
        sender_name: section
            .sender_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SENDER.to_string()),
    };

    Ok(GatewayConfig {
        server: ServerConfig {
            host,
            port,
            public_base_url,
        },
        auth,
        worker,
        status_path: expand_tilde(status_path, home.as_deref()),
        notifications,
    })
}

fn expand_tilde(path: PathBuf, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return path;
    };
    if path == Path::new("~") {
        return home.to_path_buf();
    }
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path,
    }
}
