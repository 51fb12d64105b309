use crate::network::MasternodeNetwork;
use crate::Masternode;
use mix_common::config::{build_directory, build_genesis, GenesisOutput, MasternodeEntry};
use mix_common::{
    Crypto, FeePolicy, MemoryLedger, MixError, Network, NetworkTrait, OutPoint, Transaction,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Masternode configuration as read from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct MasternodeConfig {
    /// Address to listen on (e.g., "127.0.0.1:9000")
    pub listen: String,
    #[serde(default)]
    pub network: Network,
    /// Identity key seed, 32 bytes in hex format
    pub secret_key: String,
    /// Genesis output locking this masternode's collateral.
    pub identity_vout: u32,
    pub genesis: Vec<GenesisOutput>,
    #[serde(default)]
    pub masternodes: Vec<MasternodeEntry>,
    #[serde(default)]
    pub fee_policy: FeePolicy,
}

impl MasternodeConfig {
    pub fn genesis_transaction(&self) -> Result<Transaction, MixError> {
        build_genesis(&self.genesis)
    }

    /// Builds the masternode and its devnet collaborators.
    pub fn build(&self) -> Result<Masternode, MixError> {
        let crypto = Crypto::from_hex(&self.secret_key)?;
        let genesis = self.genesis_transaction()?;
        let identity = OutPoint::new(genesis.txid(), self.identity_vout);
        let directory = Arc::new(build_directory(&self.masternodes, &genesis)?);
        let layer = Arc::new(MemoryLedger::with_genesis(genesis));
        let network = Arc::new(Box::new(MasternodeNetwork::new()) as Box<dyn NetworkTrait>);
        Masternode::new(
            network,
            crypto,
            identity,
            layer,
            directory,
            self.network,
            self.fee_policy,
        )
    }
}

pub async fn run_from_config(config: MasternodeConfig) -> Result<(), MixError> {
    let masternode = Arc::new(config.build()?);
    info!(
        "Starting masternode {} on {} ({:?})",
        masternode.identity(),
        config.listen,
        config.network
    );
    masternode.run(&config.listen).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(identity_vout: u32) -> MasternodeConfig {
        let key = Crypto::from_secret_key(&[3u8; 32]).unwrap();
        let pk = hex::encode(key.public_key().to_bytes());
        let yaml = format!(
            r#"
listen: "127.0.0.1:0"
network: testnet
secret_key: "{secret}"
identity_vout: {identity_vout}
genesis:
  - public_key: "{pk}"
    value: 100000000000
  - public_key: "{pk}"
    value: 500
masternodes:
  - identity_vout: 0
    public_key: "{pk}"
    url: "ws://127.0.0.1:9000"
"#,
            secret = "03".repeat(32),
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn parses_with_defaults() {
        let config = sample(0);
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.fee_policy, FeePolicy::default());
        assert_eq!(config.genesis.len(), 2);
    }

    #[test]
    fn builds_when_identity_holds_collateral() {
        let masternode = sample(0).build().unwrap();
        let genesis = sample(0).genesis_transaction().unwrap();
        assert_eq!(masternode.identity(), OutPoint::new(genesis.txid(), 0));
    }

    #[test]
    fn refuses_a_foreign_identity_key() {
        let mut config = sample(0);
        config.secret_key = "04".repeat(32);
        assert!(matches!(config.build(), Err(MixError::ConfigError(_))));

        let mut config = sample(0);
        config.secret_key = "not hex".to_string();
        assert!(matches!(config.build(), Err(MixError::ConfigError(_))));
    }
}
