use crate::chain::{MasternodeInfo, StaticDirectory};
use crate::crypto::{p2pkh_script, Crypto};
use crate::errors::MixError;
use crate::types::{Amount, OutPoint, Transaction, TxOut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    /// Entries merged into one transaction.
    pub fn max_participants(self) -> usize {
        match self {
            Network::Mainnet => 3,
            Network::Testnet => 2,
        }
    }

    /// Prefix mixed into every signed message so signatures cannot be
    /// replayed across networks or protocols.
    pub fn message_magic(self) -> &'static str {
        match self {
            Network::Mainnet => "Mixpool Signed Message:\n",
            Network::Testnet => "Mixpool Testnet Signed Message:\n",
        }
    }
}

/// How far a submission's inputs may exceed its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub max_fee_permille: i64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy {
            max_fee_permille: 10,
        }
    }
}

impl FeePolicy {
    /// Widened so out-of-range values cannot overflow.
    pub fn fee_too_high(&self, value_in: Amount, value_out: Amount) -> bool {
        let fee = value_in as i128 - value_out as i128;
        fee * 1000 > value_in as i128 * self.max_fee_permille as i128
    }
}

/// One output of the devnet genesis transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct GenesisOutput {
    /// hex encoded ed25519 public key
    pub public_key: String,
    pub value: Amount,
}

/// A masternode as listed in a node's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MasternodeEntry {
    /// Index of the genesis output holding the masternode collateral.
    pub identity_vout: u32,
    /// hex encoded ed25519 public key
    pub public_key: String,
    pub url: String,
}

pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, MixError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| MixError::ConfigError(format!("{}: {e}", path.display())))?;
    serde_yaml::from_str(&content)
        .map_err(|e| MixError::ConfigError(format!("{}: {e}", path.display())))
}

/// Builds the transaction every devnet node starts from.
pub fn build_genesis(outputs: &[GenesisOutput]) -> Result<Transaction, MixError> {
    let outputs = outputs
        .iter()
        .map(|o| {
            let bytes = hex::decode(&o.public_key)
                .map_err(|e| MixError::ConfigError(format!("genesis public key: {e}")))?;
            let key = Crypto::pubkey_from_bytes(&bytes)?;
            Ok(TxOut::new(o.value, p2pkh_script(&key)))
        })
        .collect::<Result<Vec<_>, MixError>>()?;
    Ok(Transaction::new(Vec::new(), outputs))
}

pub fn build_directory(
    entries: &[MasternodeEntry],
    genesis: &Transaction,
) -> Result<StaticDirectory, MixError> {
    let txid = genesis.txid();
    let nodes = entries
        .iter()
        .map(|e| {
            let bytes = hex::decode(&e.public_key)
                .map_err(|err| MixError::ConfigError(format!("masternode public key: {err}")))?;
            let public_key = Crypto::pubkey_from_bytes(&bytes)?;
            Ok(MasternodeInfo {
                identity: OutPoint::new(txid, e.identity_vout),
                public_key,
                address: e.url.clone(),
            })
        })
        .collect::<Result<Vec<_>, MixError>>()?;
    Ok(StaticDirectory::new(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::COIN;

    #[test]
    fn one_percent_threshold() {
        let policy = FeePolicy::default();
        assert!(!policy.fee_too_high(100 * COIN, 99 * COIN));
        assert!(policy.fee_too_high(100 * COIN, 99 * COIN - 1));
        assert!(!policy.fee_too_high(100 * COIN, 100 * COIN));
    }

    #[test]
    fn participants_per_network() {
        assert_eq!(Network::Mainnet.max_participants(), 3);
        assert_eq!(Network::Testnet.max_participants(), 2);
    }

    #[test]
    fn genesis_and_directory_from_yaml() {
        #[derive(Deserialize)]
        struct Doc {
            genesis: Vec<GenesisOutput>,
            masternodes: Vec<MasternodeEntry>,
        }
        let key = Crypto::from_secret_key(&[7u8; 32]).unwrap();
        let pk = hex::encode(key.public_key().to_bytes());
        let yaml = format!(
            "genesis:\n  - public_key: \"{pk}\"\n    value: 100000000000\nmasternodes:\n  - identity_vout: 0\n    public_key: \"{pk}\"\n    url: \"ws://127.0.0.1:9000\"\n"
        );
        let doc: Doc = serde_yaml::from_str(&yaml).unwrap();
        let genesis = build_genesis(&doc.genesis).unwrap();
        assert_eq!(genesis.outputs[0].value, 1000 * COIN);
        let directory = build_directory(&doc.masternodes, &genesis).unwrap();
        use crate::chain::MasternodeDirectory;
        let node = directory.find(&OutPoint::new(genesis.txid(), 0)).unwrap();
        assert_eq!(node.address, "ws://127.0.0.1:9000");
    }
}
