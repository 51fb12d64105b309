//! Collateral checks and the forfeiture policy that makes abandoning a round
//! cost something.

use crate::chain::{ScriptCheck, TransactionLayer};
use crate::entry::EntryLedger;
use crate::types::{checked_total, Amount, Transaction, COIN};
use rand::Rng;
use tracing::{debug, info, warn};

/// Minimum fee a collateral transaction must pay.
pub const COLLATERAL: Amount = COIN / 10;

/// Fee-sized output value used when splitting funds and sizing forfeits.
pub const MIX_FEE: Amount = COIN / 80;

/// Chance, out of 1000 and inclusive, that a successful round still charges
/// a participant's collateral.
pub const RANDOM_FEE_PER_MILLE: u32 = 20;

/// Sum of the outputs `tx` spends, if every one of them is known.
pub fn input_value(tx: &Transaction, layer: &dyn TransactionLayer) -> Option<Amount> {
    let values = tx
        .inputs
        .iter()
        .map(|i| layer.get_output(&i.prevout).map(|o| o.value))
        .collect::<Option<Vec<_>>>()?;
    checked_total(values)
}

pub fn is_collateral_valid(tx: &Transaction, layer: &dyn TransactionLayer) -> bool {
    if tx.outputs.is_empty() || tx.inputs.is_empty() {
        return false;
    }
    if tx.lock_time != 0 {
        debug!("Collateral rejected, lock time set");
        return false;
    }
    if tx.outputs.iter().any(|o| !o.is_standard()) {
        debug!("Collateral rejected, non-standard output");
        return false;
    }
    let Some(value_in) = input_value(tx, layer) else {
        debug!("Collateral rejected, unknown inputs");
        return false;
    };
    let Some(value_out) = tx.value_out() else {
        debug!("Collateral rejected, output value out of range");
        return false;
    };
    if value_in - value_out < COLLATERAL {
        debug!(
            "Collateral rejected, fee {} below {}",
            value_in - value_out,
            COLLATERAL
        );
        return false;
    }
    match layer.check_acceptable(tx, ScriptCheck::Verify) {
        Ok(()) => true,
        Err(e) => {
            debug!("Collateral rejected: {}", e);
            false
        }
    }
}

/// Collateral offered at queue time whose owner never submitted an entry.
pub fn unfulfilled_collateral(
    session_collateral: &[Transaction],
    ledger: &EntryLedger,
) -> Vec<Transaction> {
    session_collateral
        .iter()
        .filter(|c| !ledger.has_collateral(c))
        .cloned()
        .collect()
}

/// Collateral of every entry still missing a signature, one per entry.
pub fn unsigned_entry_collateral(ledger: &EntryLedger) -> Vec<Transaction> {
    ledger
        .iter()
        .filter(|e| !e.is_fully_signed())
        .map(|e| e.collateral().clone())
        .collect()
}

/// Each collateral is charged with probability 21 in 1000.
pub fn random_fee_collateral<R: Rng + ?Sized>(
    session_collateral: &[Transaction],
    rng: &mut R,
) -> Vec<Transaction> {
    session_collateral
        .iter()
        .filter(|_| rng.random_range(0..1000u32) <= RANDOM_FEE_PER_MILLE)
        .cloned()
        .collect()
}

/// Submits each collateral, returning how many the layer accepted.
pub fn forfeit(layer: &dyn TransactionLayer, collateral: &[Transaction]) -> usize {
    let mut charged = 0;
    for tx in collateral {
        match layer.submit(tx) {
            Ok(()) => {
                info!("Charged collateral {}", hex::encode(tx.txid()));
                charged += 1;
            }
            Err(e) => warn!("Failed to charge collateral {}: {}", hex::encode(tx.txid()), e),
        }
    }
    charged
}
