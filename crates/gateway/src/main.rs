use std::{env, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use codelexa_common::{Clock, SystemClock};
use codelexa_gateway::{
    build_gateway,
    config::{self, CliOptions},
    run_http_server,
};
use tracing_subscriber::EnvFilter;

const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "codelexa", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to a codelexa TOML configuration file
    #[arg(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Interface to bind
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Port to bind (default 4090)
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Optional log filter (e.g. info, debug, codelexa_gateway=trace)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Task runner executed for each voice task
    #[arg(long = "runner", value_name = "PATH")]
    runner: Option<PathBuf>,

    /// Where the task history is persisted
    #[arg(long = "status-file", value_name = "PATH")]
    status_file: Option<PathBuf>,

    /// Externally visible base URL the platform signs requests against
    #[arg(long = "public-base-url", value_name = "URL")]
    public_base_url: Option<String>,
}

impl Args {
    fn cli_options(&self) -> CliOptions {
        CliOptions {
            config_path: self.config_path.clone(),
            host: self.host.clone(),
            port: self.port,
            runner: self.runner.clone(),
            status_file: self.status_file.clone(),
            public_base_url: self.public_base_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args);
    tracing::info!(
        "{}",
        codelexa_build_info::formatted_banner("codelexa", GATEWAY_VERSION)
    );

    let cli = args.cli_options();
    let config_path = cli
        .config_path
        .clone()
        .or_else(|| env::var("CODELEXA_CONFIG").ok().map(PathBuf::from));
    let file = config::load_file_config(config_path.as_deref())?;
    let gateway_config = config::resolve(&cli, file.as_ref(), |key| env::var(key).ok())?;

    tracing::info!(
        runner = %gateway_config.worker.runner.display(),
        status_file = %gateway_config.status_path.display(),
        notifications = gateway_config.notifications.credentials.is_configured(),
        "configuration resolved"
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(format!("codelexa/{GATEWAY_VERSION}"))
        .build()
        .context("Failed to build outbound HTTP client")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let state = build_gateway(&gateway_config, http, clock);
    run_http_server(
        state,
        &gateway_config.server.host,
        gateway_config.server.port,
    )
    .await
}

fn init_tracing(args: &Args) {
    let filter = args
        .log_level
        .as_deref()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
}
