use crate::network::ClientNetwork;
use crate::participant::MixSettings;
use crate::rest_api::router;
use crate::wallet::MemoryWallet;
use crate::Client;
use mix_common::config::{build_directory, build_genesis, GenesisOutput, MasternodeEntry};
use mix_common::{Crypto, MemoryLedger, MixError, Network, NetworkTrait};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

fn default_rest_listen() -> String {
    "127.0.0.1:3001".to_string()
}

/// Client configuration as read from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub network: Network,
    /// Wallet key seed, 32 bytes in hex format
    pub secret_key: String,
    pub genesis: Vec<GenesisOutput>,
    pub masternodes: Vec<MasternodeEntry>,
    /// Address of the REST API
    #[serde(default = "default_rest_listen")]
    pub rest_listen: String,
    #[serde(default)]
    pub mixing: MixSettings,
}

impl ClientConfig {
    /// Builds the client over a devnet wallet funded by the genesis outputs
    /// paying to its key.
    pub fn build(&self) -> Result<Client, MixError> {
        let key = Crypto::from_hex(&self.secret_key)?;
        let genesis = build_genesis(&self.genesis)?;
        let directory = Arc::new(build_directory(&self.masternodes, &genesis)?);
        let ledger = Arc::new(MemoryLedger::with_genesis(genesis));
        let wallet = Arc::new(MemoryWallet::new(ledger, key));
        let network = Arc::new(Box::new(ClientNetwork::new()) as Box<dyn NetworkTrait>);
        Ok(Client::new(
            network,
            wallet,
            directory,
            self.network,
            self.mixing,
        ))
    }
}

pub async fn run_from_config(config: ClientConfig) -> Result<(), MixError> {
    let client = Arc::new(config.build()?);

    let runner = client.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("Client run failed: {}", e);
        }
    });

    let listener = TcpListener::bind(&config.rest_listen)
        .await
        .map_err(|e| MixError::NetworkError(e.to_string()))?;
    info!("Starting REST API on {}", config.rest_listen);
    axum::serve(listener, router(client))
        .await
        .map_err(|e| MixError::NetworkError(e.to_string()))
}
