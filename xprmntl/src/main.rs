mod config;
mod handler;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use experiments::codec;
use handler::FeaturesHandler;
use metrics_exporter_statsd::StatsdBuilder;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(version, about = "Request-scoped experiment state for HTTP services")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the gateway with the demo features handler
    Serve {
        #[arg(long, default_value = "xprmntl.yaml")]
        config: PathBuf,
    },
    /// Print the contents of an experiments cookie
    Decode {
        /// Cookie value as sent by the browser
        cookie: String,
        /// The cookie is in its text form rather than base64
        #[arg(long)]
        raw: bool,
        /// Also check the cookie against this user id
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not create statsd exporter: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Gateway(#[from] gateway::GatewayError),
    #[error(transparent)]
    Transport(#[from] gateway::cookies::TransportError),
    #[error(transparent)]
    Cookie(#[from] codec::CookieDecodeError),
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        CliCommand::Serve { config } => serve(&config),
        CliCommand::Decode { cookie, raw, user } => decode(&cookie, raw, user.as_deref()),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn serve(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;

    let _sentry = init_logging(config.common.logging.as_ref());
    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    tracing::info!(app = %config.gateway.remote.app, "starting xprmntl");
    runtime.block_on(gateway::run(config.gateway, FeaturesHandler))?;
    Ok(())
}

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`), and the
/// sentry layer when a DSN is configured. The returned guard flushes sentry on drop.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging
        .and_then(|logging| logging.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))?;
    metrics::set_global_recorder(recorder).map_err(|_| CliError::RecorderInstalled)?;

    shared::metrics_defs::describe_all(experiments::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(gateway::metrics_defs::ALL_METRICS);
    Ok(())
}

fn decode(cookie: &str, raw: bool, user: Option<&str>) -> Result<(), CliError> {
    let text = if raw {
        cookie.to_string()
    } else {
        gateway::cookies::decode_transport(cookie)?
    };

    let parsed = codec::parse(&text)?;
    if let Some(user) = user {
        parsed.clone().into_state(user)?;
    }

    let summary = json!({
        "user_id": parsed.user_id,
        "bucket": parsed.bucket,
        "stamps": parsed.stamps,
        "dirty": parsed.dirty,
    });
    println!("{summary:#}");
    Ok(())
}
