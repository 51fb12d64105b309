use clap::Parser;
use mix_common::config::load_yaml;
use mix_masternode::config::{run_from_config, MasternodeConfig};
use tracing::error;

/// Command line arguments for the masternode
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config: MasternodeConfig = match load_yaml(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return;
        }
    };

    if let Err(e) = run_from_config(config).await {
        error!("Masternode failed: {}", e);
    }
}
