use crate::crypto::verify_input_signature;
use crate::errors::MixError;
use crate::types::{checked_total, Amount, OutPoint, Transaction, TxId, TxOut};
use dashmap::{DashMap, DashSet};
use ed25519_dalek::VerifyingKey as PublicKey;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Whether an acceptability check also verifies input signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCheck {
    Skip,
    Verify,
}

/// Transaction lookup, validation and relay as seen by the mixing protocol.
pub trait TransactionLayer: Send + Sync {
    fn get_transaction(&self, txid: &TxId) -> Option<Transaction>;

    fn get_output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.get_transaction(&outpoint.txid)
            .and_then(|tx| tx.outputs.get(outpoint.vout as usize).cloned())
    }

    /// Would `tx` be admitted right now.
    fn check_acceptable(&self, tx: &Transaction, scripts: ScriptCheck) -> Result<(), MixError>;

    /// Admits `tx` and relays it.
    fn submit(&self, tx: &Transaction) -> Result<(), MixError>;

    fn best_height(&self) -> u64;
}

/// In-process transaction layer for devnets and tests.
///
/// Every accepted transaction counts as one block.
#[derive(Default)]
pub struct MemoryLedger {
    txs: DashMap<TxId, Transaction>,
    spent: DashMap<OutPoint, TxId>,
    submitted: DashSet<TxId>,
    height: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_genesis(genesis: Transaction) -> Self {
        let ledger = Self::new();
        ledger.insert(genesis);
        ledger
    }

    /// Records `tx` as confirmed without any validation.
    pub fn insert(&self, tx: Transaction) -> TxId {
        let txid = tx.txid();
        for input in &tx.inputs {
            self.spent.insert(input.prevout, txid);
        }
        self.txs.insert(txid, tx);
        txid
    }

    /// Records `tx`, relayed and validated elsewhere, as one more block.
    pub fn confirm(&self, tx: Transaction) -> TxId {
        let txid = self.insert(tx);
        self.height.fetch_add(1, Ordering::SeqCst);
        txid
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains_key(outpoint)
    }

    pub fn was_submitted(&self, txid: &TxId) -> bool {
        self.submitted.contains(txid)
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.len()
    }

    /// Unspent outputs locked by `script_pubkey`.
    pub fn unspent_for(&self, script_pubkey: &[u8]) -> Vec<(OutPoint, TxOut)> {
        let mut coins = Vec::new();
        for entry in self.txs.iter() {
            for (vout, out) in entry.value().outputs.iter().enumerate() {
                let outpoint = OutPoint::new(*entry.key(), vout as u32);
                if out.script_pubkey == script_pubkey && !self.is_spent(&outpoint) {
                    coins.push((outpoint, out.clone()));
                }
            }
        }
        coins.sort_by_key(|(outpoint, _)| *outpoint);
        coins
    }

    fn value_in(&self, tx: &Transaction) -> Result<Amount, MixError> {
        let mut values = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let prev = self
                .get_output(&input.prevout)
                .ok_or(MixError::MissingReferencedTransaction)?;
            values.push(prev.value);
        }
        checked_total(values)
            .ok_or_else(|| MixError::TransactionRejected("input value out of range".to_string()))
    }
}

impl TransactionLayer for MemoryLedger {
    fn get_transaction(&self, txid: &TxId) -> Option<Transaction> {
        self.txs.get(txid).map(|tx| tx.value().clone())
    }

    fn check_acceptable(&self, tx: &Transaction, scripts: ScriptCheck) -> Result<(), MixError> {
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(MixError::TransactionRejected("empty inputs or outputs".to_string()));
        }
        let value_out = tx
            .value_out()
            .ok_or_else(|| MixError::TransactionRejected("output value out of range".to_string()))?;
        let mut seen = HashSet::new();
        for input in &tx.inputs {
            if !seen.insert(input.prevout) {
                return Err(MixError::TransactionRejected(format!(
                    "duplicate input {}",
                    input.prevout
                )));
            }
            if self.is_spent(&input.prevout) {
                return Err(MixError::TransactionRejected(format!(
                    "input {} already spent",
                    input.prevout
                )));
            }
        }
        let value_in = self.value_in(tx)?;
        if value_in < value_out {
            return Err(MixError::TransactionRejected(
                "outputs exceed inputs".to_string(),
            ));
        }
        if scripts == ScriptCheck::Verify {
            for (index, input) in tx.inputs.iter().enumerate() {
                let prev = self
                    .get_output(&input.prevout)
                    .ok_or(MixError::MissingReferencedTransaction)?;
                verify_input_signature(tx, index, &input.script_sig, &prev.script_pubkey)
                    .map_err(|_| {
                        MixError::TransactionRejected(format!(
                            "bad signature on input {}",
                            input.prevout
                        ))
                    })?;
            }
        }
        Ok(())
    }

    fn submit(&self, tx: &Transaction) -> Result<(), MixError> {
        let txid = tx.txid();
        if self.txs.contains_key(&txid) {
            debug!("Transaction {} already known", hex::encode(txid));
            return Ok(());
        }
        self.check_acceptable(tx, ScriptCheck::Verify)?;
        self.insert(tx.clone());
        self.submitted.insert(txid);
        let height = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Accepted transaction {} at height {}", hex::encode(txid), height);
        Ok(())
    }

    fn best_height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasternodeInfo {
    /// The input locking the masternode collateral.
    pub identity: OutPoint,
    pub public_key: PublicKey,
    /// websocket url
    pub address: String,
}

pub trait MasternodeDirectory: Send + Sync {
    fn find(&self, identity: &OutPoint) -> Option<MasternodeInfo>;

    fn all(&self) -> Vec<MasternodeInfo>;

    fn len(&self) -> usize {
        self.all().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops masternodes that stopped responding, returning how many.
    fn prune_inactive(&self) -> usize {
        0
    }
}

/// A directory fixed at startup from configuration.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    nodes: DashMap<OutPoint, MasternodeInfo>,
}

impl StaticDirectory {
    pub fn new(nodes: Vec<MasternodeInfo>) -> Self {
        let directory = Self::default();
        for node in nodes {
            directory.nodes.insert(node.identity, node);
        }
        directory
    }

    pub fn remove(&self, identity: &OutPoint) -> Option<MasternodeInfo> {
        self.nodes.remove(identity).map(|(_, node)| node)
    }
}

impl MasternodeDirectory for StaticDirectory {
    fn find(&self, identity: &OutPoint) -> Option<MasternodeInfo> {
        self.nodes.get(identity).map(|n| n.value().clone())
    }

    fn all(&self) -> Vec<MasternodeInfo> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by_key(|n| n.identity);
        nodes
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Crypto;
    use crate::types::{TxIn, COIN};

    fn setup() -> (Crypto, MemoryLedger, OutPoint) {
        let owner = Crypto::from_secret_key(&[1u8; 32]).unwrap();
        let genesis = Transaction::new(
            Vec::new(),
            vec![TxOut::new(10 * COIN, owner.script_pubkey())],
        );
        let txid = genesis.txid();
        (owner, MemoryLedger::with_genesis(genesis), OutPoint::new(txid, 0))
    }

    fn spend(owner: &Crypto, coin: OutPoint, value: Amount) -> Transaction {
        let mut tx = Transaction::new(
            vec![TxIn::new(coin)],
            vec![TxOut::new(value, owner.script_pubkey())],
        );
        tx.inputs[0].script_sig = owner.sign_input(&tx, 0).unwrap();
        tx
    }

    #[test]
    fn submit_spends_inputs() {
        let (owner, ledger, coin) = setup();
        let tx = spend(&owner, coin, 9 * COIN);
        assert!(ledger.submit(&tx).is_ok());
        assert!(ledger.is_spent(&coin));
        assert!(ledger.was_submitted(&tx.txid()));
        assert_eq!(ledger.best_height(), 1);

        let double = spend(&owner, coin, 8 * COIN);
        assert!(matches!(
            ledger.submit(&double),
            Err(MixError::TransactionRejected(_))
        ));
    }

    #[test]
    fn script_check_is_optional() {
        let (owner, ledger, coin) = setup();
        let mut tx = spend(&owner, coin, 9 * COIN);
        tx.inputs[0].script_sig.clear();
        assert!(ledger.check_acceptable(&tx, ScriptCheck::Skip).is_ok());
        assert!(ledger.check_acceptable(&tx, ScriptCheck::Verify).is_err());
    }

    #[test]
    fn rejects_inflation_and_unknown_inputs() {
        let (owner, ledger, coin) = setup();
        let tx = spend(&owner, coin, 11 * COIN);
        assert!(ledger.check_acceptable(&tx, ScriptCheck::Skip).is_err());

        let unknown = spend(&owner, OutPoint::new([5u8; 32], 0), COIN);
        assert_eq!(
            ledger.check_acceptable(&unknown, ScriptCheck::Skip),
            Err(MixError::MissingReferencedTransaction)
        );
    }

    #[test]
    fn rejects_overflowing_outputs() {
        let (owner, ledger, coin) = setup();
        let mut tx = spend(&owner, coin, 9 * COIN);
        tx.outputs.push(TxOut::new(i64::MAX, owner.script_pubkey()));
        tx.outputs.push(TxOut::new(i64::MAX, owner.script_pubkey()));
        assert!(matches!(
            ledger.check_acceptable(&tx, ScriptCheck::Skip),
            Err(MixError::TransactionRejected(_))
        ));
    }

    #[test]
    fn unspent_tracks_spends() {
        let (owner, ledger, coin) = setup();
        assert_eq!(ledger.unspent_for(&owner.script_pubkey()).len(), 1);
        let tx = spend(&owner, coin, 9 * COIN);
        ledger.submit(&tx).unwrap();
        let coins = ledger.unspent_for(&owner.script_pubkey());
        assert_eq!(coins.len(), 1);
        assert_eq!(coins[0].0, OutPoint::new(tx.txid(), 0));
    }
}
