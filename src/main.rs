use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smerge::config::Config;
use smerge::server;

#[derive(Parser)]
#[command(
    name = "smerge",
    version,
    about = "Subscription merge service: fetches grouped text feeds and serves merged artifacts over HTTP",
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Enable verbose logging
    #[arg(long)]
    dev: bool,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;
    let dev = cli.dev || config.debug;
    setup_tracing(&cli.log_format, dev)?;

    let version_info = format!("smerge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), dev, "smerge starting");

    server::run(config, &version_info).await?;

    tracing::info!("stopped");
    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("smerge=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("smerge=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}
