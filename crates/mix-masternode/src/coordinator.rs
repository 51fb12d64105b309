//! The coordinator's side of a mixing round.

use crate::{ENTRIES, FORFEITS, ROUNDS_FAILED, ROUNDS_TRANSMITTED};
use mix_common::collateral::{
    forfeit, is_collateral_valid, random_fee_collateral, unfulfilled_collateral,
    unsigned_entry_collateral,
};
use mix_common::denomination::{classify, describe, is_session_denomination, DenominationMask};
use mix_common::session::{ACCEPTING_TIMEOUT_MS, FINALIZE_TIMEOUT_MS, SIGNING_TIMEOUT_MS};
use mix_common::{
    checked_total, AcceptCode, Amount, Crypto, EntryLedger, FeePolicy, Message, MixError, Network,
    OutPoint, PoolState, QueueAnnouncement, QueueRateLimiter, ScriptCheck, Session, StatusUpdate,
    Transaction, TransactionLayer, TxIn, TxOut,
};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CoordinatorSession {
    session: Session,
    network: Network,
    fee_policy: FeePolicy,
    identity: OutPoint,
    crypto: Crypto,
    layer: Arc<dyn TransactionLayer>,
    ledger: EntryLedger,
    session_users: usize,
    session_collateral: Vec<Transaction>,
    final_tx: Transaction,
    limiter: QueueRateLimiter,
    outbox: Vec<Message>,
}

impl CoordinatorSession {
    pub fn new(
        network: Network,
        fee_policy: FeePolicy,
        identity: OutPoint,
        crypto: Crypto,
        layer: Arc<dyn TransactionLayer>,
        now_ms: i64,
    ) -> Self {
        let mut session = CoordinatorSession {
            session: Session::new(PoolState::AcceptingEntries, now_ms),
            network,
            fee_policy,
            identity,
            crypto,
            layer,
            ledger: EntryLedger::new(network.max_participants()),
            session_users: 0,
            session_collateral: Vec::new(),
            final_tx: Transaction::default(),
            limiter: QueueRateLimiter::new(),
            outbox: Vec::new(),
        };
        session.set_null(true, now_ms);
        session.outbox.clear();
        session
    }

    pub fn state(&self) -> PoolState {
        self.session.state()
    }

    pub fn session_id(&self) -> i32 {
        self.session.session_id
    }

    pub fn denom(&self) -> DenominationMask {
        self.session.denom
    }

    pub fn session_users(&self) -> usize {
        self.session_users
    }

    pub fn entries(&self) -> &EntryLedger {
        &self.ledger
    }

    pub fn final_transaction(&self) -> &Transaction {
        &self.final_tx
    }

    pub fn max_participants(&self) -> usize {
        self.network.max_participants()
    }

    pub fn limiter(&self) -> &QueueRateLimiter {
        &self.limiter
    }

    pub fn limiter_mut(&mut self) -> &mut QueueRateLimiter {
        &mut self.limiter
    }

    /// Messages to broadcast, in the order they were produced.
    pub fn take_outbound(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn is_session_ready(&self) -> bool {
        self.session_users >= self.max_participants()
    }

    /// The reply to a `dsa` or `dsi` from one participant.
    pub fn status_reply(&self, result: &Result<(), MixError>) -> StatusUpdate {
        match result {
            Ok(()) => self.status(AcceptCode::Accepted, ""),
            Err(e) => self.status(AcceptCode::Rejected, e.to_string()),
        }
    }

    pub fn status(&self, accepted: AcceptCode, error: impl Into<String>) -> StatusUpdate {
        StatusUpdate::new(
            self.session.session_id,
            self.session.state(),
            self.ledger.len(),
            accepted,
            error,
        )
    }

    /// Lets a participant with collateral join the round, opening it for
    /// `denom` when nobody has joined yet.
    pub fn is_compatible_with_session(
        &mut self,
        denom: DenominationMask,
        collateral: &Transaction,
        now_ms: i64,
    ) -> Result<(), MixError> {
        if !is_session_denomination(denom) {
            return Err(MixError::InvalidInput);
        }
        if !is_collateral_valid(collateral, self.layer.as_ref()) {
            return Err(MixError::CollateralInvalid);
        }

        if self.session_users == 0 {
            self.session.denom = denom;
            self.session_users = 1;
            self.session.touch(now_ms);
            self.ledger.clear();
            self.session_collateral.push(collateral.clone());
            self.announce(false, now_ms);
            self.update_state(PoolState::Queue, now_ms);
            info!(
                "Opened session {} for {}",
                self.session.session_id,
                describe(denom)
            );
            return Ok(());
        }

        let state = self.session.state();
        if state != PoolState::AcceptingEntries && state != PoolState::Queue {
            return Err(MixError::WrongState);
        }
        if self.session_users >= self.max_participants() {
            return Err(MixError::SessionFull);
        }
        if denom != self.session.denom {
            return Err(MixError::DenominationMismatch);
        }
        self.session_users += 1;
        self.session.touch(now_ms);
        self.session_collateral.push(collateral.clone());
        debug!(
            "Session {} has {} of {} users",
            self.session.session_id,
            self.session_users,
            self.max_participants()
        );
        Ok(())
    }

    /// Validates and admits one participant's inputs and outputs.
    pub fn submit_entry(
        &mut self,
        inputs: Vec<TxIn>,
        amount: Amount,
        collateral: Transaction,
        outputs: Vec<TxOut>,
        now_ms: i64,
    ) -> Result<(), MixError> {
        if !self.is_session_ready() {
            return Err(MixError::SessionNotReady);
        }
        if classify(&outputs) != self.session.denom {
            return Err(MixError::DenominationMismatch);
        }
        self.check_entry_transaction(&inputs, &outputs)?;

        if self.session.state() != PoolState::AcceptingEntries {
            self.session_users = self.session_users.saturating_sub(1);
            return Err(MixError::WrongState);
        }
        if let Err(e) = self.ledger.admit(
            inputs,
            amount,
            collateral,
            outputs,
            self.layer.as_ref(),
            now_ms,
        ) {
            self.session_users = self.session_users.saturating_sub(1);
            return Err(e);
        }
        self.session.touch(now_ms);
        ENTRIES.set(self.ledger.len() as f64);
        info!(
            "Session {} admitted entry {} of {}",
            self.session.session_id,
            self.ledger.len(),
            self.ledger.capacity()
        );

        self.check(now_ms);
        self.broadcast_status();
        Ok(())
    }

    /// The submission must already look like a valid transaction on its own.
    fn check_entry_transaction(&self, inputs: &[TxIn], outputs: &[TxOut]) -> Result<(), MixError> {
        if outputs.iter().any(|o| !o.is_standard()) {
            return Err(MixError::NonStandardOutputScript);
        }
        let mut values_in = Vec::with_capacity(inputs.len());
        for input in inputs {
            match self.layer.get_output(&input.prevout) {
                Some(prev) => values_in.push(prev.value),
                None => return Err(MixError::MissingReferencedTransaction),
            }
        }
        let value_in = checked_total(values_in).ok_or(MixError::InvalidInput)?;
        let value_out =
            checked_total(outputs.iter().map(|o| o.value)).ok_or(MixError::InvalidInput)?;
        if self.fee_policy.fee_too_high(value_in, value_out) {
            return Err(MixError::FeeTooHigh);
        }
        let tx = Transaction::new(inputs.to_vec(), outputs.to_vec());
        self.layer
            .check_acceptable(&tx, ScriptCheck::Skip)
            .map_err(|e| match e {
                MixError::TransactionRejected(_) => e,
                other => MixError::TransactionRejected(other.to_string()),
            })
    }

    /// True when some input of `vins` belongs to an admitted entry.
    pub fn has_entry_for(&self, vins: &[TxIn]) -> bool {
        vins.iter().any(|v| self.ledger.contains_input(&v.prevout))
    }

    /// Records one signature; only meaningful while signing.
    pub fn add_script_sig(&mut self, vin: &TxIn) -> bool {
        if self.session.state() != PoolState::Signing {
            debug!("Ignoring signature for {} outside signing", vin.prevout);
            return false;
        }
        self.ledger
            .attach_signature(vin, &mut self.final_tx, self.layer.as_ref())
    }

    /// Handles a `dss`: every signature must be accepted for the round to move on.
    pub fn add_signatures(&mut self, vins: &[TxIn], now_ms: i64) -> bool {
        let mut success = true;
        for vin in vins {
            if !self.add_script_sig(vin) {
                success = false;
            }
        }
        if success {
            self.check(now_ms);
            self.broadcast_status();
        }
        success
    }

    /// Drives the round forward as far as its current data allows.
    pub fn check(&mut self, now_ms: i64) {
        if self.session.state() == PoolState::Queue && self.is_session_ready() {
            self.announce(true, now_ms);
            self.update_state(PoolState::AcceptingEntries, now_ms);
        }

        if self.session.state() == PoolState::AcceptingEntries && self.ledger.is_full() {
            self.update_state(PoolState::FinalizeTransaction, now_ms);
        }

        if self.session.state() == PoolState::FinalizeTransaction {
            self.final_tx = self.ledger.merge(self.session.shuffle_seed());
            info!(
                "Session {} finalized with {} inputs and {} outputs",
                self.session.session_id,
                self.final_tx.inputs.len(),
                self.final_tx.outputs.len()
            );
            self.outbox.push(Message::Dsf {
                session_id: self.session.session_id,
                tx: self.final_tx.clone(),
            });
            self.update_state(PoolState::Signing, now_ms);
        }

        if self.session.state() == PoolState::Signing
            && !self.ledger.is_empty()
            && self.ledger.all_signed()
        {
            self.update_state(PoolState::Transmission, now_ms);
            self.transmit(now_ms);
        }
    }

    fn transmit(&mut self, now_ms: i64) {
        let session_id = self.session.session_id;
        match self.layer.submit(&self.final_tx) {
            Ok(()) => {
                info!(
                    "Session {} transmitted {}",
                    session_id,
                    hex::encode(self.final_tx.txid())
                );
                ROUNDS_TRANSMITTED.inc();
                self.outbox.push(Message::Dsc {
                    session_id,
                    error: false,
                    message: "Transaction created successfully".to_string(),
                });
                self.charge_random_fees();
                self.set_null(true, now_ms);
            }
            Err(e) => {
                warn!("Session {} transaction not valid, resetting: {}", session_id, e);
                ROUNDS_FAILED.inc();
                self.set_null(true, now_ms);
                self.outbox.push(Message::Dsc {
                    session_id,
                    error: true,
                    message: "Transaction not valid, please try again".to_string(),
                });
            }
        }
    }

    /// The liveness sweep, run once a second.
    pub fn check_timeout(&mut self, now_ms: i64) {
        self.check(now_ms);

        match self.session.state() {
            PoolState::Queue | PoolState::AcceptingEntries => {
                if self.ledger.purge_expired(now_ms) > 0 {
                    if self.ledger.is_empty() {
                        info!("Session {} lost its last entry", self.session.session_id);
                        self.set_null(true, now_ms);
                        return;
                    }
                    ENTRIES.set(self.ledger.len() as f64);
                    self.broadcast_status();
                }
                if self.session.elapsed(now_ms) >= ACCEPTING_TIMEOUT_MS {
                    if self.session_users == 0 && self.ledger.is_empty() {
                        self.session.touch(now_ms);
                        return;
                    }
                    info!("Session {} timed out accepting entries", self.session.session_id);
                    let offenders = unfulfilled_collateral(&self.session_collateral, &self.ledger);
                    self.charge(&offenders);
                    let status =
                        self.status(AcceptCode::Rejected, MixError::SessionTimedOut.to_string());
                    self.outbox.push(Message::Dssu(status));
                    self.set_null(true, now_ms);
                }
            }
            PoolState::Signing => {
                if self.session.elapsed(now_ms) >= SIGNING_TIMEOUT_MS {
                    let session_id = self.session.session_id;
                    info!("Session {} timed out signing", session_id);
                    let offenders = unsigned_entry_collateral(&self.ledger);
                    self.charge(&offenders);
                    self.outbox.push(Message::Dsc {
                        session_id,
                        error: true,
                        message: "Signing timed out, please resubmit".to_string(),
                    });
                    self.set_null(true, now_ms);
                }
            }
            PoolState::FinalizeTransaction | PoolState::Transmission => {
                if self.session.elapsed(now_ms) >= FINALIZE_TIMEOUT_MS {
                    warn!(
                        "Session {} stuck in {}, resetting",
                        self.session.session_id,
                        self.session.state()
                    );
                    self.set_null(false, now_ms);
                }
            }
            _ => {}
        }
    }

    fn charge(&self, offenders: &[Transaction]) {
        if offenders.is_empty() {
            return;
        }
        let charged = forfeit(self.layer.as_ref(), offenders);
        FORFEITS.inc_by(charged as f64);
    }

    fn charge_random_fees(&self) {
        let mut rng = rand::rng();
        let charged = random_fee_collateral(&self.session_collateral, &mut rng);
        self.charge(&charged);
    }

    /// Signed queue announcement for the open session. Open announcements
    /// count towards our own rate limit.
    fn announce(&mut self, ready: bool, now_ms: i64) {
        let mut dsq =
            QueueAnnouncement::new(self.session.denom, self.identity, now_ms / 1000, ready);
        dsq.sign(&self.crypto, self.network);
        if !ready {
            self.limiter.record(self.identity);
        }
        self.outbox.push(Message::Dsq(dsq));
    }

    fn broadcast_status(&mut self) {
        let status = self.status(AcceptCode::Reset, "");
        self.outbox.push(Message::Dssu(status));
    }

    fn update_state(&mut self, state: PoolState, now_ms: i64) {
        let previous = self.session.state();
        if self.session.set_state(state, now_ms) {
            debug!(
                "Session {} {} -> {}",
                self.session.session_id, previous, state
            );
            self.broadcast_status();
        }
    }

    /// Ends the round. A hard reset also starts a new session id.
    pub fn set_null(&mut self, clear_everything: bool, now_ms: i64) {
        self.ledger.clear();
        ENTRIES.set(0.0);
        self.final_tx = Transaction::default();
        self.session_users = 0;
        self.session.denom = 0;
        self.session_collateral.clear();
        if clear_everything {
            self.session.session_id = 1 + rand::rng().random_range(0..999_999);
        }
        self.session.reseed();
        self.update_state(PoolState::AcceptingEntries, now_ms);
        self.session.touch(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mix_common::collateral::COLLATERAL;
    use mix_common::denomination::NON_STANDARD_BIT;
    use mix_common::testing::{devnet, Devnet, Participant};
    use mix_common::types::COIN;

    const T0: i64 = 1_000_000;

    fn coordinator(net: &Devnet, network: Network) -> CoordinatorSession {
        CoordinatorSession::new(
            network,
            FeePolicy::default(),
            net.identity,
            mix_common::testing::keypair(100),
            net.ledger.clone(),
            T0,
        )
    }

    fn join(c: &mut CoordinatorSession, p: &Participant, now: i64) -> Result<(), MixError> {
        let denom = classify(&p.outputs());
        let result = c.is_compatible_with_session(denom, &p.collateral, now);
        if result.is_ok() {
            c.check(now);
        }
        result
    }

    fn submit(c: &mut CoordinatorSession, p: &Participant, now: i64) -> Result<(), MixError> {
        c.submit_entry(p.inputs(), p.amount(), p.collateral.clone(), p.outputs(), now)
    }

    fn dsf(outbox: &[Message]) -> Option<Transaction> {
        outbox.iter().find_map(|m| match m {
            Message::Dsf { tx, .. } => Some(tx.clone()),
            _ => None,
        })
    }

    fn dsc(outbox: &[Message]) -> Option<(bool, String)> {
        outbox.iter().find_map(|m| match m {
            Message::Dsc { error, message, .. } => Some((*error, message.clone())),
            _ => None,
        })
    }

    /// Joins and submits every participant, returning the merged transaction.
    fn fill(c: &mut CoordinatorSession, net: &Devnet, now: i64) -> Transaction {
        for p in &net.participants {
            join(c, p, now).unwrap();
        }
        for p in &net.participants {
            submit(c, p, now).unwrap();
        }
        dsf(&c.take_outbound()).unwrap()
    }

    #[test]
    fn starts_idle_with_a_session_id() {
        let net = devnet(1, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Mainnet);
        assert_eq!(c.state(), PoolState::AcceptingEntries);
        assert!((1..=999_999).contains(&c.session_id()));
        assert!(c.take_outbound().is_empty());
    }

    #[test]
    fn queue_fills_to_capacity() {
        let net = devnet(4, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Mainnet);
        let ps = &net.participants;

        join(&mut c, &ps[0], T0).unwrap();
        assert_eq!(c.state(), PoolState::Queue);
        let out = c.take_outbound();
        assert!(matches!(&out[0], Message::Dsq(q) if !q.ready));

        join(&mut c, &ps[1], T0).unwrap();
        assert_eq!(c.state(), PoolState::Queue);
        join(&mut c, &ps[2], T0).unwrap();
        assert_eq!(c.state(), PoolState::AcceptingEntries);
        assert_eq!(c.session_users(), 3);
        let out = c.take_outbound();
        let dsq = out
            .iter()
            .find_map(|m| match m {
                Message::Dsq(q) => Some(q.clone()),
                _ => None,
            })
            .unwrap();
        assert!(dsq.ready);
        assert!(dsq
            .check_signature(&net.masternode.public_key(), Network::Mainnet)
            .is_ok());

        assert_eq!(join(&mut c, &ps[3], T0), Err(MixError::SessionFull));
    }

    #[test]
    fn denomination_mismatch_is_rejected() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let ps = &net.participants;
        c.is_compatible_with_session(0b1000, &ps[0].collateral, T0)
            .unwrap();
        assert_eq!(
            c.is_compatible_with_session(0b0100, &ps[1].collateral, T0),
            Err(MixError::DenominationMismatch)
        );
        assert_eq!(c.session_users(), 1);
        assert_eq!(c.denom(), 0b1000);
    }

    #[test]
    fn sessions_open_only_for_standard_denominations() {
        let net = devnet(1, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let collateral = &net.participants[0].collateral;
        for denom in [0, NON_STANDARD_BIT, 0b1000 | NON_STANDARD_BIT, 1 << 9] {
            assert_eq!(
                c.is_compatible_with_session(denom, collateral, T0),
                Err(MixError::InvalidInput)
            );
        }
        assert_eq!(c.session_users(), 0);
        assert_eq!(c.state(), PoolState::AcceptingEntries);
    }

    #[test]
    fn open_announcement_is_timed_and_counted() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        join(&mut c, &net.participants[0], T0 + 2_500).unwrap();
        let out = c.take_outbound();
        assert!(matches!(&out[0], Message::Dsq(q) if q.time == (T0 + 2_500) / 1000));
        assert_eq!(c.limiter().count(), 1);
        assert!(c.limiter().is_throttled(&net.identity, 5));

        // the ready announcement is not counted
        join(&mut c, &net.participants[1], T0 + 3_000).unwrap();
        assert_eq!(c.limiter().count(), 1);
    }

    #[test]
    fn signatures_without_an_entry_are_recognised() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let ps = &net.participants;
        join(&mut c, &ps[0], T0).unwrap();
        join(&mut c, &ps[1], T0).unwrap();
        submit(&mut c, &ps[0], T0).unwrap();
        assert!(c.has_entry_for(&ps[0].inputs()));
        assert!(!c.has_entry_for(&ps[1].inputs()));
        assert!(!c.has_entry_for(&[]));
    }

    #[test]
    fn invalid_collateral_cannot_join() {
        let net = devnet(1, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let mut cheap = net.participants[0].collateral.clone();
        cheap.outputs[0].value += 1;
        assert_eq!(
            c.is_compatible_with_session(0b1000, &cheap, T0),
            Err(MixError::CollateralInvalid)
        );
        assert_eq!(c.state(), PoolState::AcceptingEntries);
    }

    #[test]
    fn entries_wait_for_the_queue() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        join(&mut c, &net.participants[0], T0).unwrap();
        assert_eq!(
            submit(&mut c, &net.participants[0], T0),
            Err(MixError::SessionNotReady)
        );
    }

    #[test]
    fn full_round_is_transmitted() {
        let net = devnet(2, &[COIN + 1, 10 * COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let session_id = c.session_id();
        let merged = fill(&mut c, &net, T0);
        assert_eq!(c.state(), PoolState::Signing);
        assert_eq!(merged.inputs.len(), 4);
        for p in &net.participants {
            assert!(c.entries().iter().any(|e| e.outputs_intact(&merged)));
            assert!(!p.sign(&merged).is_empty());
        }

        assert!(c.add_signatures(&net.participants[0].sign(&merged), T0));
        assert_eq!(c.state(), PoolState::Signing);
        assert!(c.add_signatures(&net.participants[1].sign(&merged), T0));

        let out = c.take_outbound();
        assert_eq!(dsc(&out), Some((false, "Transaction created successfully".to_string())));
        assert!(out
            .iter()
            .any(|m| matches!(m, Message::Dsc { session_id: id, .. } if *id == session_id)));
        assert_eq!(c.state(), PoolState::AcceptingEntries);
        assert!(c.entries().is_empty());
        assert!(c.final_transaction().is_empty());
        for p in &net.participants {
            for (coin, _) in &p.coins {
                assert!(net.ledger.is_spent(coin));
            }
        }
    }

    #[test]
    fn signatures_outside_signing_are_ignored() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let merged = fill(&mut c, &net, T0);
        let vins = net.participants[0].sign(&merged);
        assert!(c.add_signatures(&vins, T0));
        assert!(!c.add_signatures(&vins, T0));

        c.set_null(true, T0);
        assert!(!c.add_script_sig(&vins[0]));
    }

    #[test]
    fn unknown_signature_changes_nothing() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let merged = fill(&mut c, &net, T0);
        let stranger = mix_common::testing::keypair(77);
        let mut vin = TxIn::new(OutPoint::new([6u8; 32], 1));
        vin.script_sig = stranger.sign_input(&merged, 0).unwrap();
        assert!(!c.add_signatures(&[vin], T0));
        assert_eq!(c.final_transaction(), &merged);
        assert_eq!(c.state(), PoolState::Signing);
        assert!(c.take_outbound().is_empty());
    }

    #[test]
    fn signing_timeout_charges_the_unsigned() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let merged = fill(&mut c, &net, T0);
        assert!(c.add_signatures(&net.participants[0].sign(&merged), T0));
        c.take_outbound();

        c.check_timeout(T0 + SIGNING_TIMEOUT_MS - 1);
        assert_eq!(c.state(), PoolState::Signing);

        c.check_timeout(T0 + SIGNING_TIMEOUT_MS);
        assert_eq!(c.state(), PoolState::AcceptingEntries);
        let out = c.take_outbound();
        assert_eq!(dsc(&out), Some((true, "Signing timed out, please resubmit".to_string())));
        assert!(!net.ledger.was_submitted(&net.participants[0].collateral.txid()));
        assert!(net.ledger.was_submitted(&net.participants[1].collateral.txid()));
    }

    #[test]
    fn accepting_timeout_charges_missing_entries() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let ps = &net.participants;
        join(&mut c, &ps[0], T0).unwrap();
        join(&mut c, &ps[1], T0).unwrap();
        submit(&mut c, &ps[0], T0).unwrap();
        c.take_outbound();

        c.check_timeout(T0 + ACCEPTING_TIMEOUT_MS);
        assert_eq!(c.state(), PoolState::AcceptingEntries);
        assert_eq!(c.session_users(), 0);
        let out = c.take_outbound();
        assert!(out.iter().any(|m| matches!(
            m,
            Message::Dssu(s) if s.accepted == AcceptCode::Rejected.to_wire()
        )));
        assert!(!net.ledger.was_submitted(&ps[0].collateral.txid()));
        assert!(net.ledger.was_submitted(&ps[1].collateral.txid()));
    }

    #[test]
    fn idle_sessions_do_not_time_out() {
        let net = devnet(1, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let id = c.session_id();
        c.check_timeout(T0 + 10 * ACCEPTING_TIMEOUT_MS);
        assert_eq!(c.session_id(), id);
        assert!(c.take_outbound().is_empty());
    }

    #[test]
    fn expired_entries_reset_the_session() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let ps = &net.participants;
        join(&mut c, &ps[0], T0).unwrap();
        join(&mut c, &ps[1], T0).unwrap();
        submit(&mut c, &ps[0], T0).unwrap();
        let id = c.session_id();

        // keep the session alive so only entry expiry can end it
        c.session.touch(T0 + 100_000);
        c.check_timeout(T0 + 119_000);
        assert_eq!(c.entries().len(), 1);
        c.check_timeout(T0 + 121_000);
        assert!(c.entries().is_empty());
        assert_ne!(c.session_id(), id);
    }

    #[test]
    fn submission_checks() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let ps = &net.participants;
        join(&mut c, &ps[0], T0).unwrap();
        join(&mut c, &ps[1], T0).unwrap();

        let mut outputs = ps[0].outputs();
        outputs[0].script_pubkey = vec![0u8; 25];
        assert_eq!(
            c.submit_entry(ps[0].inputs(), 0, ps[0].collateral.clone(), outputs, T0),
            Err(MixError::NonStandardOutputScript)
        );

        let missing = vec![TxIn::new(OutPoint::new([42u8; 32], 0))];
        assert_eq!(
            c.submit_entry(missing, 0, ps[0].collateral.clone(), ps[0].outputs(), T0),
            Err(MixError::MissingReferencedTransaction)
        );

        let mut extra = ps[0].inputs();
        extra.push(TxIn::new(ps[0].collateral.inputs[0].prevout));
        assert_eq!(
            c.submit_entry(extra, 0, ps[0].collateral.clone(), ps[0].outputs(), T0),
            Err(MixError::FeeTooHigh)
        );

        let wrong_denom = vec![TxOut::new(COIN + 1 - COLLATERAL, ps[0].key.script_pubkey())];
        assert_eq!(
            c.submit_entry(ps[0].inputs(), 0, ps[0].collateral.clone(), wrong_denom, T0),
            Err(MixError::DenominationMismatch)
        );
        assert_eq!(c.entries().len(), 0);
        assert_eq!(c.session_users(), 2);
    }

    #[test]
    fn failed_admission_releases_a_user() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let ps = &net.participants;
        join(&mut c, &ps[0], T0).unwrap();
        join(&mut c, &ps[1], T0).unwrap();
        submit(&mut c, &ps[0], T0).unwrap();
        assert_eq!(submit(&mut c, &ps[0], T0), Err(MixError::DuplicateInput));
        assert_eq!(c.session_users(), 1);
    }

    #[test]
    fn rejected_transmission_resets_with_error() {
        let net = devnet(2, &[COIN + 1]);
        let mut c = coordinator(&net, Network::Testnet);
        let merged = fill(&mut c, &net, T0);
        let first = net.participants[0].sign(&merged);
        let second = net.participants[1].sign(&merged);
        assert!(c.add_signatures(&first, T0));

        // spend one mixed coin behind the coordinator's back
        let p = &net.participants[1];
        let coin = p.coins[0].0;
        let mut theft = Transaction::new(
            vec![TxIn::new(coin)],
            vec![TxOut::new(COIN, p.key.script_pubkey())],
        );
        theft.inputs[0].script_sig = p.key.sign_input(&theft, 0).unwrap();
        net.ledger.submit(&theft).unwrap();

        assert!(c.add_signatures(&second, T0));
        let out = c.take_outbound();
        assert_eq!(dsc(&out), Some((true, "Transaction not valid, please try again".to_string())));
        assert_eq!(c.state(), PoolState::AcceptingEntries);
    }
}
