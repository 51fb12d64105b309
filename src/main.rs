use clap::{Parser, Subcommand};
use mix_client::config::ClientConfig;
use mix_common::config::load_yaml;
use mix_masternode::config::MasternodeConfig;
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Masternode-coordinated coin mixing", long_about = None)]
struct Args {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Coordinate mixing sessions
    Masternode {
        /// Path to the YAML configuration file
        #[arg(short, long)]
        config: String,
    },
    /// Take part in mixing sessions
    Client {
        /// Path to the YAML configuration file
        #[arg(short, long)]
        config: String,
    },
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

    let result = match args.role {
        Role::Masternode { config } => match load_yaml::<MasternodeConfig>(&config) {
            Ok(config) => mix_masternode::config::run_from_config(config).await,
            Err(e) => Err(e),
        },
        Role::Client { config } => match load_yaml::<ClientConfig>(&config) {
            Ok(config) => mix_client::config::run_from_config(config).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        error!("mixpool stopped: {}", e);
    }
}
