//! Fixtures shared by the unit and integration tests of every crate.

use crate::chain::{MasternodeInfo, MemoryLedger, StaticDirectory};
use crate::collateral::COLLATERAL;
use crate::crypto::{Crypto, MASTERNODE_COLLATERAL};
use crate::denomination::denominate;
use crate::types::{Amount, OutPoint, Transaction, TxIn, TxOut, COIN};
use std::sync::Arc;

/// Value of the coin each participant funds its collateral from.
pub const COLLATERAL_COIN: Amount = COIN;

pub fn keypair(seed: u8) -> Crypto {
    Crypto::from_secret_key(&[seed; 32]).expect("valid test key")
}

/// A wallet-less participant: a key, the coins it mixes and a signed
/// collateral transaction.
pub struct Participant {
    pub key: Crypto,
    pub coins: Vec<(OutPoint, TxOut)>,
    pub collateral: Transaction,
}

impl Participant {
    pub fn inputs(&self) -> Vec<TxIn> {
        self.coins.iter().map(|(o, _)| TxIn::new(*o)).collect()
    }

    pub fn amount(&self) -> Amount {
        self.coins.iter().map(|(_, c)| c.value).sum()
    }

    /// The standard decomposition of the coins, paid back to the same key.
    pub fn outputs(&self) -> Vec<TxOut> {
        let (values, _) = denominate(self.amount());
        values
            .into_iter()
            .map(|v| TxOut::new(v, self.key.script_pubkey()))
            .collect()
    }

    /// Signature-carrying copies of this participant's inputs in `merged`.
    pub fn sign(&self, merged: &Transaction) -> Vec<TxIn> {
        merged
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, i)| self.coins.iter().any(|(o, _)| *o == i.prevout))
            .map(|(index, input)| {
                let mut vin = input.clone();
                vin.script_sig = self.key.sign_input(merged, index).expect("input in range");
                vin
            })
            .collect()
    }
}

/// A signed transaction spending `coin` that pays exactly the minimum
/// collateral fee.
pub fn collateral_spending(owner: &Crypto, coin: OutPoint, value: Amount) -> Transaction {
    let mut tx = Transaction::new(
        vec![TxIn::new(coin)],
        vec![TxOut::new(value - COLLATERAL, owner.script_pubkey())],
    );
    tx.inputs[0].script_sig = owner.sign_input(&tx, 0).expect("input in range");
    tx
}

pub struct Devnet {
    pub ledger: Arc<MemoryLedger>,
    pub genesis: Transaction,
    pub masternode: Crypto,
    pub identity: OutPoint,
    pub directory: Arc<StaticDirectory>,
    pub participants: Vec<Participant>,
}

/// Genesis output 0 is the masternode collateral; then, per participant,
/// one output per `coin_values` entry followed by its collateral coin.
pub fn devnet(participants: u8, coin_values: &[Amount]) -> Devnet {
    let masternode = keypair(100);
    let keys: Vec<Crypto> = (1..=participants).map(keypair).collect();

    let mut outputs = vec![TxOut::new(MASTERNODE_COLLATERAL, masternode.script_pubkey())];
    for key in &keys {
        for value in coin_values {
            outputs.push(TxOut::new(*value, key.script_pubkey()));
        }
        outputs.push(TxOut::new(COLLATERAL_COIN, key.script_pubkey()));
    }
    let genesis = Transaction::new(Vec::new(), outputs);
    let txid = genesis.txid();
    let ledger = Arc::new(MemoryLedger::with_genesis(genesis.clone()));

    let mut vout = 1u32;
    let participants = keys
        .into_iter()
        .map(|key| {
            let mut coins = Vec::new();
            for value in coin_values {
                coins.push((
                    OutPoint::new(txid, vout),
                    TxOut::new(*value, key.script_pubkey()),
                ));
                vout += 1;
            }
            let collateral = collateral_spending(&key, OutPoint::new(txid, vout), COLLATERAL_COIN);
            vout += 1;
            Participant {
                key,
                coins,
                collateral,
            }
        })
        .collect();

    let identity = OutPoint::new(txid, 0);
    let directory = Arc::new(StaticDirectory::new(vec![MasternodeInfo {
        identity,
        public_key: masternode.public_key(),
        address: "ws://127.0.0.1:9000".to_string(),
    }]));

    Devnet {
        ledger,
        genesis,
        masternode,
        identity,
        directory,
        participants,
    }
}

pub fn funded_ledger(
    participants: u8,
    coin_values: &[Amount],
) -> (Arc<MemoryLedger>, Vec<Participant>) {
    let net = devnet(participants, coin_values);
    (net.ledger, net.participants)
}

/// A fresh collateral from the first unspent non-denominated coin of `owner`.
pub fn collateral_for(ledger: &MemoryLedger, owner: &Crypto) -> Option<Transaction> {
    ledger
        .unspent_for(&owner.script_pubkey())
        .into_iter()
        .find(|(_, out)| !crate::denomination::is_denominated(out.value) && out.value > COLLATERAL)
        .map(|(coin, out)| collateral_spending(owner, coin, out.value))
}
