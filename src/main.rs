//! NFC Relay Server
//!
//! Run with: cargo run -- serve --config config.toml
//!
//! # Configuration
//!
//! Settings come from a TOML file (see `init-config`) with environment
//! overrides:
//! - `NFC_RELAY_HOST`, `NFC_RELAY_PORT`: Listen address (default: 0.0.0.0:8888)
//! - `NFC_RELAY_JWT_SECRET`: HS256 secret for client tokens (required)
//! - `NFC_RELAY_SESSION_TIMEOUT_SECS`: Idle session timeout (default: 300)
//! - `NFC_RELAY_LOG_LEVEL`, `NFC_RELAY_LOG_FORMAT`: Logging (default: info, pretty)
//! - `RUST_LOG`: Overrides the log filter entirely

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nfc_relay::config::generate_default_config;
use nfc_relay::relay::metrics::install_recorder;
use nfc_relay::{serve, AppState, Config, JwtValidator, LoggingConfig, RelayHub, TracingAuditSink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "nfc-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Relays NFC APDU traffic between card providers and POS receivers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server
    Serve {
        /// Config file (default: search standard locations)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Generate default config file
    InitConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = match config {
                Some(path) => Config::load_with_env(&path)?,
                None => Config::load_default(),
            };
            init_tracing(&config.logging);
            run(config).await
        }
        Commands::InitConfig { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("nfc_relay={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting NFC relay v{}", env!("CARGO_PKG_VERSION"));

    if config.auth.jwt_secret.trim().is_empty() {
        bail!("auth.jwt_secret is empty; set it in the config file or NFC_RELAY_JWT_SECRET");
    }

    let metrics = match install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder unavailable, /metrics disabled");
            None
        }
    };

    let validator = Arc::new(JwtValidator::new(&config.auth.jwt_secret));
    let (hub, dispatcher) =
        RelayHub::new(config.relay.clone(), validator, Arc::new(TracingAuditSink));
    let dispatcher = tokio::spawn(dispatcher.run());

    tracing::info!(
        session_timeout_secs = config.relay.session_timeout().as_secs(),
        "Relay hub configured"
    );

    let mut state = AppState::new(hub.clone(), config);
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    let result = serve(state).await;

    hub.shutdown().await;
    if let Err(e) = dispatcher.await {
        tracing::warn!(error = %e, "Dispatcher ended abnormally");
    }
    hub.wait_background().await;

    tracing::info!("NFC relay stopped");
    result.map_err(Into::into)
}
