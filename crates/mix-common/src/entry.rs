//! Entries: what one participant brought to the current round, and the
//! coordinator's ledger of admitted entries.

use crate::chain::TransactionLayer;
use crate::collateral::is_collateral_valid;
use crate::crypto::verify_input_signature;
use crate::denomination::{classify, DenominationMask};
use crate::errors::MixError;
use crate::types::{checked_total, Amount, OutPoint, Transaction, TxIn, TxOut};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::debug;

/// Entries older than this are dropped from the ledger.
pub const ENTRY_TIMEOUT_MS: i64 = 120_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryVin {
    pub vin: TxIn,
    pub signed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    inputs: Vec<EntryVin>,
    amount: Amount,
    collateral: Transaction,
    outputs: Vec<TxOut>,
    created_at: i64,
}

impl Entry {
    pub fn new(
        inputs: Vec<TxIn>,
        amount: Amount,
        collateral: Transaction,
        outputs: Vec<TxOut>,
        now_ms: i64,
    ) -> Self {
        let inputs = inputs
            .into_iter()
            .map(|vin| EntryVin {
                vin: TxIn {
                    script_sig: Vec::new(),
                    ..vin
                },
                signed: false,
            })
            .collect();
        Entry {
            inputs,
            amount,
            collateral,
            outputs,
            created_at: now_ms,
        }
    }

    pub fn inputs(&self) -> &[EntryVin] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    pub fn collateral(&self) -> &Transaction {
        &self.collateral
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn denomination(&self) -> DenominationMask {
        classify(&self.outputs)
    }

    pub fn output_total(&self) -> Option<Amount> {
        checked_total(self.outputs.iter().map(|o| o.value))
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.created_at > ENTRY_TIMEOUT_MS
    }

    pub fn contains_input(&self, prevout: &OutPoint) -> bool {
        self.inputs.iter().any(|i| i.vin.prevout == *prevout)
    }

    pub fn is_fully_signed(&self) -> bool {
        self.inputs.iter().all(|i| i.signed)
    }

    /// Attaches the signature script of `vin` to the matching unsigned slot.
    pub fn add_sig(&mut self, vin: &TxIn) -> bool {
        match self.inputs.iter_mut().find(|i| i.vin.same_slot(vin)) {
            Some(slot) if !slot.signed => {
                slot.vin.script_sig = vin.script_sig.clone();
                slot.signed = true;
                true
            }
            _ => false,
        }
    }

    /// True when every declared output appears in `tx` verbatim, each matched
    /// output of `tx` counted once.
    pub fn outputs_intact(&self, tx: &Transaction) -> bool {
        let mut used = vec![false; tx.outputs.len()];
        let mut matched = Vec::with_capacity(self.outputs.len());
        for declared in &self.outputs {
            let found = tx
                .outputs
                .iter()
                .enumerate()
                .position(|(i, out)| !used[i] && out == declared);
            match found {
                Some(i) => {
                    used[i] = true;
                    matched.push(tx.outputs[i].value);
                }
                None => return false,
            }
        }
        self.output_total().is_some() && checked_total(matched) == self.output_total()
    }
}

/// The coordinator's admitted entries for the current round.
#[derive(Debug, Clone)]
pub struct EntryLedger {
    entries: Vec<Entry>,
    capacity: usize,
}

impl EntryLedger {
    pub fn new(capacity: usize) -> Self {
        EntryLedger {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn has_collateral(&self, collateral: &Transaction) -> bool {
        self.entries.iter().any(|e| e.collateral == *collateral)
    }

    pub fn contains_input(&self, prevout: &OutPoint) -> bool {
        self.entries.iter().any(|e| e.contains_input(prevout))
    }

    pub fn admit(
        &mut self,
        inputs: Vec<TxIn>,
        amount: Amount,
        collateral: Transaction,
        outputs: Vec<TxOut>,
        layer: &dyn TransactionLayer,
        now_ms: i64,
    ) -> Result<&Entry, MixError> {
        if amount < 0 || inputs.iter().any(|i| i.prevout.is_null()) {
            return Err(MixError::InvalidInput);
        }
        if !is_collateral_valid(&collateral, layer) {
            return Err(MixError::CollateralInvalid);
        }
        if self.is_full() {
            return Err(MixError::SessionFull);
        }
        let mut seen = HashSet::new();
        for input in &inputs {
            if !seen.insert(input.prevout) || self.contains_input(&input.prevout) {
                debug!("Rejecting entry, input {} already admitted", input.prevout);
                return Err(MixError::DuplicateInput);
            }
        }
        self.entries
            .push(Entry::new(inputs, amount, collateral, outputs, now_ms));
        self.entries.last().ok_or(MixError::InvalidInput)
    }

    /// Verifies the signature carried by `vin` against `merged` and records it.
    ///
    /// Returns false, leaving everything untouched, when no admitted input
    /// matches, the slot is already signed or the signature does not verify.
    pub fn attach_signature(
        &mut self,
        vin: &TxIn,
        merged: &mut Transaction,
        layer: &dyn TransactionLayer,
    ) -> bool {
        let Some(index) = merged.inputs.iter().position(|i| i.same_slot(vin)) else {
            return false;
        };
        let Some(entry) = self.entries.iter_mut().find(|e| {
            e.inputs
                .iter()
                .any(|i| i.vin.same_slot(vin) && !i.signed)
        }) else {
            return false;
        };
        let Some(prev) = layer.get_output(&vin.prevout) else {
            return false;
        };
        if let Err(e) = verify_input_signature(merged, index, &vin.script_sig, &prev.script_pubkey)
        {
            debug!("Signature for {} rejected: {}", vin.prevout, e);
            return false;
        }
        if !entry.add_sig(vin) {
            return false;
        }
        merged.inputs[index].script_sig = vin.script_sig.clone();
        true
    }

    pub fn all_signed(&self) -> bool {
        self.entries.iter().all(Entry::is_fully_signed)
    }

    /// Drops expired entries and returns how many went.
    pub fn purge_expired(&mut self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_expired(now_ms));
        before - self.entries.len()
    }

    /// Builds the unsigned joint transaction: inputs in admission order,
    /// outputs permuted by `seed`.
    pub fn merge(&self, seed: [u8; 32]) -> Transaction {
        let inputs = self
            .entries
            .iter()
            .flat_map(|e| e.inputs.iter().map(|i| i.vin.clone()))
            .collect();
        let mut outputs: Vec<TxOut> = self
            .entries
            .iter()
            .flat_map(|e| e.outputs.iter().cloned())
            .collect();
        let mut rng = StdRng::from_seed(seed);
        outputs.shuffle(&mut rng);
        Transaction::new(inputs, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryLedger;
    use crate::crypto::Crypto;
    use crate::testing::{collateral_for, funded_ledger, keypair, Participant};
    use crate::types::COIN;
    use std::sync::Arc;

    fn participants(n: u8) -> (Arc<MemoryLedger>, Vec<Participant>) {
        funded_ledger(n, &[COIN + 1, COIN + 1])
    }

    fn admit(
        ledger: &mut EntryLedger,
        layer: &MemoryLedger,
        p: &Participant,
        now: i64,
    ) -> Result<(), MixError> {
        ledger
            .admit(
                p.inputs(),
                p.amount(),
                p.collateral.clone(),
                p.outputs(),
                layer,
                now,
            )
            .map(|_| ())
    }

    fn sign_all(
        ledger: &mut EntryLedger,
        merged: &mut Transaction,
        layer: &MemoryLedger,
        ps: &[Participant],
    ) {
        let unsigned = merged.clone();
        for p in ps {
            for vin in p.sign(&unsigned) {
                assert!(ledger.attach_signature(&vin, merged, layer));
            }
        }
    }

    #[test]
    fn admit_rejects_overlapping_inputs() {
        let (layer, ps) = participants(2);
        let mut ledger = EntryLedger::new(3);
        admit(&mut ledger, &layer, &ps[0], 0).unwrap();
        assert_eq!(admit(&mut ledger, &layer, &ps[0], 0), Err(MixError::DuplicateInput));

        let mut twice = ps[1].inputs();
        twice.push(twice[0].clone());
        let res = ledger.admit(twice, 0, ps[1].collateral.clone(), ps[1].outputs(), &*layer, 0);
        assert_eq!(res.map(|_| ()), Err(MixError::DuplicateInput));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn admit_checks_in_order() {
        let (layer, ps) = participants(2);
        let mut ledger = EntryLedger::new(1);
        let res = ledger.admit(
            vec![TxIn::new(OutPoint::null())],
            0,
            Transaction::default(),
            Vec::new(),
            &*layer,
            0,
        );
        assert_eq!(res.map(|_| ()), Err(MixError::InvalidInput));

        let res = ledger.admit(
            ps[0].inputs(),
            -1,
            ps[0].collateral.clone(),
            ps[0].outputs(),
            &*layer,
            0,
        );
        assert_eq!(res.map(|_| ()), Err(MixError::InvalidInput));

        let res = ledger.admit(
            ps[0].inputs(),
            0,
            Transaction::default(),
            ps[0].outputs(),
            &*layer,
            0,
        );
        assert_eq!(res.map(|_| ()), Err(MixError::CollateralInvalid));

        admit(&mut ledger, &layer, &ps[0], 0).unwrap();
        assert_eq!(admit(&mut ledger, &layer, &ps[1], 0), Err(MixError::SessionFull));
    }

    #[test]
    fn all_signed_for_one_two_and_max_entries() {
        for n in 1..=3u8 {
            let (layer, ps) = participants(n);
            let mut ledger = EntryLedger::new(3);
            for p in &ps {
                admit(&mut ledger, &layer, p, 0).unwrap();
            }
            let mut merged = ledger.merge([n; 32]);
            assert!(!ledger.all_signed());
            let (last, rest) = ps.split_last().unwrap();
            sign_all(&mut ledger, &mut merged, &layer, rest);
            assert!(!ledger.all_signed(), "{n} entries");
            sign_all(&mut ledger, &mut merged, &layer, std::slice::from_ref(last));
            assert!(ledger.all_signed(), "{n} entries");
            assert!(merged.inputs.iter().all(TxIn::is_signed));
        }
    }

    #[test]
    fn signatures_are_attached_once() {
        let (layer, ps) = participants(1);
        let mut ledger = EntryLedger::new(3);
        admit(&mut ledger, &layer, &ps[0], 0).unwrap();
        let mut merged = ledger.merge([0u8; 32]);
        let unsigned = merged.clone();
        let vins = ps[0].sign(&unsigned);
        assert!(ledger.attach_signature(&vins[0], &mut merged, &*layer));
        assert!(!ledger.attach_signature(&vins[0], &mut merged, &*layer));
    }

    #[test]
    fn unknown_signature_has_no_effect() {
        let (layer, ps) = participants(1);
        let mut ledger = EntryLedger::new(3);
        admit(&mut ledger, &layer, &ps[0], 0).unwrap();
        let mut merged = ledger.merge([0u8; 32]);
        let before = merged.clone();

        let stranger = keypair(200);
        let mut vin = TxIn::new(OutPoint::new([3u8; 32], 7));
        vin.script_sig = stranger.sign_input(&merged, 0).unwrap();
        assert!(!ledger.attach_signature(&vin, &mut merged, &*layer));

        // a known slot with someone else's signature
        let mut forged = merged.inputs[0].clone();
        forged.script_sig = stranger.sign_input(&merged, 0).unwrap();
        assert!(!ledger.attach_signature(&forged, &mut merged, &*layer));

        assert_eq!(merged, before);
        assert!(ledger.iter().all(|e| e.inputs().iter().all(|i| !i.signed)));
    }

    #[test]
    fn expiry_is_strictly_after_timeout() {
        let (layer, ps) = participants(1);
        let mut ledger = EntryLedger::new(3);
        let t = 1_000_000;
        admit(&mut ledger, &layer, &ps[0], t).unwrap();
        assert_eq!(ledger.purge_expired(t + 119_000), 0);
        assert_eq!(ledger.purge_expired(t + ENTRY_TIMEOUT_MS), 0);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.purge_expired(t + 121_000), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn merged_outputs_are_intact_and_seeded() {
        let (layer, ps) = participants(3);
        let mut ledger = EntryLedger::new(3);
        for p in &ps {
            admit(&mut ledger, &layer, p, 0).unwrap();
        }
        let a = ledger.merge([1u8; 32]);
        let b = ledger.merge([1u8; 32]);
        assert_eq!(a, b);
        for entry in ledger.iter() {
            assert!(entry.outputs_intact(&a));
        }
        let total: Amount = ledger.iter().filter_map(Entry::output_total).sum();
        assert_eq!(a.value_out(), Some(total));

        let mut tampered = a.clone();
        tampered.outputs[0].value -= 1;
        assert!(ledger.iter().any(|e| !e.outputs_intact(&tampered)));

        let mut dropped = a.clone();
        dropped.outputs.pop();
        assert!(ledger.iter().any(|e| !e.outputs_intact(&dropped)));
    }

    #[test]
    fn collateral_lookup() {
        let (layer, ps) = participants(2);
        let mut ledger = EntryLedger::new(3);
        admit(&mut ledger, &layer, &ps[0], 0).unwrap();
        assert!(ledger.has_collateral(&ps[0].collateral));
        assert!(!ledger.has_collateral(&ps[1].collateral));
        let owner: &Crypto = &ps[1].key;
        let other = collateral_for(&layer, owner);
        assert!(other.is_some());
    }
}
