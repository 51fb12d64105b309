//! What a participant needs from its wallet, and the devnet wallet backed by
//! a `MemoryLedger`.

use dashmap::{DashMap, DashSet};
use mix_common::chain::ScriptCheck;
use mix_common::collateral::COLLATERAL;
use mix_common::denomination::is_denominated;
use mix_common::{
    Amount, Crypto, MemoryLedger, MixError, OutPoint, Transaction, TransactionLayer, TxId, TxIn,
    TxOut,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub trait Wallet: Send + Sync {
    /// Locked behind a passphrase, unable to sign.
    fn is_locked(&self) -> bool;

    fn best_height(&self) -> u64;

    /// Unspent coins owned by the wallet and not reserved by a round.
    fn available_coins(&self) -> Vec<(OutPoint, TxOut)>;

    fn get_transaction(&self, txid: &TxId) -> Option<Transaction>;

    fn is_mine(&self, output: &TxOut) -> bool;

    /// True when the output `outpoint` refers to is known and ours.
    fn owns(&self, outpoint: &OutPoint) -> bool {
        self.get_transaction(&outpoint.txid)
            .and_then(|tx| tx.outputs.get(outpoint.vout as usize).cloned())
            .is_some_and(|out| self.is_mine(&out))
    }

    fn lock_coin(&self, outpoint: OutPoint);

    fn unlock_coin(&self, outpoint: &OutPoint);

    fn is_locked_coin(&self, outpoint: &OutPoint) -> bool;

    fn new_destination(&self) -> Vec<u8>;

    /// A signed transaction paying the collateral fee out of one of our
    /// non-denominated coins. It is only ever broadcast by a coordinator.
    fn create_collateral(&self) -> Result<Transaction, MixError>;

    fn has_collateral_inputs(&self) -> bool;

    /// Pays `values` to ourselves out of non-denominated coins, change
    /// included, and submits the result.
    fn split_up(&self, values: &[Amount]) -> Result<Transaction, MixError>;

    fn sign_input(&self, tx: &Transaction, index: usize) -> Result<Vec<u8>, MixError>;

    /// Acceptability of `tx` with signature checks skipped.
    fn check_acceptable(&self, tx: &Transaction) -> Result<(), MixError>;

    /// Remembers a transaction relayed by somebody else.
    fn record_transaction(&self, tx: &Transaction);
}

/// Wallet over an in-process ledger. Funds arrive at the root key; every
/// destination handed out is a fresh child of it.
pub struct MemoryWallet {
    ledger: Arc<MemoryLedger>,
    root: Crypto,
    /// child index of every derived destination script
    children: DashMap<Vec<u8>, u32>,
    next_child: AtomicU32,
    reserved: DashSet<OutPoint>,
    locked: AtomicBool,
}

impl MemoryWallet {
    pub fn new(ledger: Arc<MemoryLedger>, root: Crypto) -> Self {
        MemoryWallet {
            ledger,
            root,
            children: DashMap::new(),
            next_child: AtomicU32::new(1),
            reserved: DashSet::new(),
            locked: AtomicBool::new(false),
        }
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn ledger(&self) -> Arc<MemoryLedger> {
        self.ledger.clone()
    }

    /// Everything unspent we can sign for, reserved or not.
    fn unspent(&self) -> Vec<(OutPoint, TxOut)> {
        let mut coins = self.ledger.unspent_for(&self.root.script_pubkey());
        for child in self.children.iter() {
            coins.extend(self.ledger.unspent_for(child.key()));
        }
        coins.sort_by_key(|(outpoint, _)| *outpoint);
        coins
    }

    pub fn balance(&self) -> Amount {
        self.unspent().iter().map(|(_, out)| out.value).sum()
    }

    fn non_denominated_coins(&self) -> Vec<(OutPoint, TxOut)> {
        self.available_coins()
            .into_iter()
            .filter(|(_, out)| !is_denominated(out.value))
            .collect()
    }

    /// Signs input `index` with whichever of our keys locks the coin it spends.
    fn sign_owned(&self, tx: &Transaction, index: usize) -> Result<Vec<u8>, MixError> {
        let input = tx.inputs.get(index).ok_or_else(|| {
            MixError::WalletError(format!("input {} out of range", index))
        })?;
        let prev = self
            .ledger
            .get_output(&input.prevout)
            .ok_or(MixError::MissingReferencedTransaction)?;
        if prev.script_pubkey == self.root.script_pubkey() {
            return self.root.sign_input(tx, index);
        }
        let child = self
            .children
            .get(&prev.script_pubkey)
            .map(|c| *c.value())
            .ok_or_else(|| MixError::WalletError(format!("{} is not ours", input.prevout)))?;
        self.root.derive(child).sign_input(tx, index)
    }

    fn sign_all(&self, tx: &mut Transaction) -> Result<(), MixError> {
        for index in 0..tx.inputs.len() {
            tx.inputs[index].script_sig = self.sign_owned(tx, index)?;
        }
        Ok(())
    }
}

impl Wallet for MemoryWallet {
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn best_height(&self) -> u64 {
        self.ledger.best_height()
    }

    fn available_coins(&self) -> Vec<(OutPoint, TxOut)> {
        self.unspent()
            .into_iter()
            .filter(|(outpoint, _)| !self.reserved.contains(outpoint))
            .collect()
    }

    fn get_transaction(&self, txid: &TxId) -> Option<Transaction> {
        self.ledger.get_transaction(txid)
    }

    fn is_mine(&self, output: &TxOut) -> bool {
        output.script_pubkey == self.root.script_pubkey()
            || self.children.contains_key(&output.script_pubkey)
    }

    fn lock_coin(&self, outpoint: OutPoint) {
        self.reserved.insert(outpoint);
    }

    fn unlock_coin(&self, outpoint: &OutPoint) {
        self.reserved.remove(outpoint);
    }

    fn is_locked_coin(&self, outpoint: &OutPoint) -> bool {
        self.reserved.contains(outpoint)
    }

    fn new_destination(&self) -> Vec<u8> {
        let index = self.next_child.fetch_add(1, Ordering::SeqCst);
        let script = self.root.derive(index).script_pubkey();
        self.children.insert(script.clone(), index);
        script
    }

    fn create_collateral(&self) -> Result<Transaction, MixError> {
        if self.is_locked() {
            return Err(MixError::WalletError("wallet is locked".to_string()));
        }
        // smallest coin that covers the fee
        let (coin, out) = self
            .non_denominated_coins()
            .into_iter()
            .filter(|(_, out)| out.value > COLLATERAL)
            .min_by_key(|(_, out)| out.value)
            .ok_or_else(|| MixError::WalletError("no collateral-sized inputs".to_string()))?;
        let mut tx = Transaction::new(
            vec![TxIn::new(coin)],
            vec![TxOut::new(out.value - COLLATERAL, self.new_destination())],
        );
        self.sign_all(&mut tx)?;
        debug!("Created collateral {} from {}", hex::encode(tx.txid()), coin);
        Ok(tx)
    }

    fn has_collateral_inputs(&self) -> bool {
        self.non_denominated_coins()
            .iter()
            .any(|(_, out)| out.value > COLLATERAL)
    }

    fn split_up(&self, values: &[Amount]) -> Result<Transaction, MixError> {
        if self.is_locked() {
            return Err(MixError::WalletError("wallet is locked".to_string()));
        }
        let target: Amount = values.iter().sum();
        let mut coins = self.non_denominated_coins();
        coins.sort_by(|a, b| b.1.value.cmp(&a.1.value));

        let mut inputs = Vec::new();
        let mut value_in = 0;
        for (outpoint, out) in coins {
            if value_in >= target {
                break;
            }
            inputs.push(TxIn::new(outpoint));
            value_in += out.value;
        }
        if value_in < target || inputs.is_empty() {
            return Err(MixError::WalletError(format!(
                "insufficient funds to split, have {} need {}",
                value_in, target
            )));
        }

        let mut outputs: Vec<TxOut> = values
            .iter()
            .map(|v| TxOut::new(*v, self.new_destination()))
            .collect();
        if value_in > target {
            outputs.push(TxOut::new(value_in - target, self.new_destination()));
        }
        let mut tx = Transaction::new(inputs, outputs);
        self.sign_all(&mut tx)?;
        self.ledger.submit(&tx)?;
        info!(
            "Split {} into {} outputs with {}",
            value_in,
            tx.outputs.len(),
            hex::encode(tx.txid())
        );
        Ok(tx)
    }

    fn sign_input(&self, tx: &Transaction, index: usize) -> Result<Vec<u8>, MixError> {
        if self.is_locked() {
            return Err(MixError::WalletError("wallet is locked".to_string()));
        }
        self.sign_owned(tx, index)
    }

    fn check_acceptable(&self, tx: &Transaction) -> Result<(), MixError> {
        self.ledger.check_acceptable(tx, ScriptCheck::Skip)
    }

    fn record_transaction(&self, tx: &Transaction) {
        if self.ledger.get_transaction(&tx.txid()).is_none() {
            self.ledger.confirm(tx.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mix_common::collateral::input_value;
    use mix_common::testing::{funded_ledger, keypair};
    use mix_common::COIN;

    fn wallet(values: &[Amount]) -> MemoryWallet {
        let (ledger, _) = funded_ledger(1, values);
        MemoryWallet::new(ledger, keypair(1))
    }

    #[test]
    fn reserved_coins_are_not_available() {
        let w = wallet(&[COIN + 1, 10 * COIN + 1]);
        let coins = w.available_coins();
        assert_eq!(coins.len(), 3);
        w.lock_coin(coins[0].0);
        assert!(w.is_locked_coin(&coins[0].0));
        assert_eq!(w.available_coins().len(), 2);
        w.unlock_coin(&coins[0].0);
        assert_eq!(w.available_coins().len(), 3);
    }

    #[test]
    fn collateral_pays_the_fee() {
        let w = wallet(&[COIN + 1]);
        let collateral = w.create_collateral().unwrap();
        let ledger = w.ledger();
        let value_in = input_value(&collateral, ledger.as_ref()).unwrap();
        assert_eq!(value_in - collateral.value_out().unwrap(), COLLATERAL);
        assert!(ledger
            .check_acceptable(&collateral, ScriptCheck::Verify)
            .is_ok());
    }

    #[test]
    fn locked_wallet_cannot_sign() {
        let w = wallet(&[COIN + 1]);
        w.set_locked(true);
        assert!(matches!(w.create_collateral(), Err(MixError::WalletError(_))));
        w.set_locked(false);
        assert!(w.create_collateral().is_ok());
    }

    #[test]
    fn split_returns_change() {
        let w = wallet(&[7 * COIN]);
        let before = w.balance();
        let tx = w.split_up(&[COIN + 1, COIN + 1]).unwrap();
        // two pieces plus change, funded by the 7 COIN coin alone
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 3);
        assert_eq!(w.balance(), before);
        assert_eq!(w.best_height(), 1);
        assert!(w.split_up(&[100 * COIN]).is_err());
    }

    #[test]
    fn destinations_are_fresh_and_spendable() {
        let w = wallet(&[7 * COIN]);
        let first = w.new_destination();
        let second = w.new_destination();
        assert_ne!(first, second);
        assert_ne!(first, keypair(1).script_pubkey());
        assert!(w.is_mine(&TxOut::new(1, first)));
        assert!(!w.is_mine(&TxOut::new(1, keypair(9).script_pubkey())));

        // the split pays derived keys only, and they can spend again
        let split = w.split_up(&[COIN + 1, COIN + 1]).unwrap();
        assert!(split
            .outputs
            .iter()
            .all(|o| o.script_pubkey != keypair(1).script_pubkey() && w.is_mine(o)));
        let (root_coin, _) = w
            .available_coins()
            .into_iter()
            .find(|(_, out)| out.value == COIN)
            .unwrap();
        w.lock_coin(root_coin);
        let collateral = w.create_collateral().unwrap();
        assert_eq!(collateral.inputs[0].prevout, OutPoint::new(split.txid(), 2));
        assert!(w
            .ledger()
            .check_acceptable(&collateral, ScriptCheck::Verify)
            .is_ok());
    }

    #[test]
    fn owns_checks_the_spent_output() {
        let w = wallet(&[COIN + 1]);
        let (coin, _) = w.available_coins()[0].clone();
        assert!(w.owns(&coin));
        assert!(!w.owns(&OutPoint::new(coin.txid, 99)));
        let stranger = MemoryWallet::new(w.ledger(), keypair(9));
        assert!(!stranger.owns(&coin));
    }
}
