use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Value in the smallest unit.
pub type Amount = i64;

pub const COIN: Amount = 100_000_000;

/// No single value, and no sum of values, may exceed this.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Adds up `values`, or `None` once any value or partial sum leaves
/// `0..=MAX_MONEY`.
pub fn checked_total<I: IntoIterator<Item = Amount>>(values: I) -> Option<Amount> {
    values.into_iter().try_fold(0, |total: Amount, value| {
        if !money_range(value) {
            return None;
        }
        total.checked_add(value).filter(|t| money_range(*t))
    })
}

pub type TxId = [u8; 32];

pub const SEQUENCE_FINAL: u32 = u32::MAX;

/// Length of a standard pay-to-pubkey-hash destination script.
pub const STANDARD_SCRIPT_LEN: usize = 25;

/// Reference to one output of a previous transaction.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: TxId, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    pub fn null() -> Self {
        OutPoint {
            txid: [0u8; 32],
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == [0u8; 32] && self.vout == u32::MAX
    }
}

impl Default for OutPoint {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hex::encode(self.txid), self.vout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct TxIn {
    pub prevout: OutPoint,
    #[serde(with = "serde_bytes")]
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint) -> Self {
        TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.script_sig.is_empty()
    }

    /// Two inputs occupy the same slot when they spend the same output with the
    /// same sequence number, whatever their signature scripts are.
    pub fn same_slot(&self, other: &TxIn) -> bool {
        self.prevout == other.prevout && self.sequence == other.sequence
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct TxOut {
    pub value: Amount,
    #[serde(with = "serde_bytes")]
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        TxOut {
            value,
            script_pubkey,
        }
    }

    /// OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
    pub fn is_standard(&self) -> bool {
        let s = &self.script_pubkey;
        s.len() == STANDARD_SCRIPT_LEN
            && s[0] == 0x76
            && s[1] == 0xa9
            && s[2] == 0x14
            && s[23] == 0x88
            && s[24] == 0xac
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }
}

impl Transaction {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        Transaction {
            inputs,
            outputs,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    /// `None` when an output value, or their sum, is out of range.
    pub fn value_out(&self) -> Option<Amount> {
        checked_total(self.outputs.iter().map(|o| o.value))
    }

    /// Signature scripts are left out, so signing never changes the id.
    pub fn txid(&self) -> TxId {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update((self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.prevout.txid);
            hasher.update(input.prevout.vout.to_le_bytes());
            hasher.update(input.sequence.to_le_bytes());
        }
        hasher.update((self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            hasher.update(output.value.to_le_bytes());
            hasher.update((output.script_pubkey.len() as u32).to_le_bytes());
            hasher.update(&output.script_pubkey);
        }
        hasher.update(self.lock_time.to_le_bytes());
        hasher.finalize().into()
    }
}
