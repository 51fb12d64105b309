//! The participant side of a round: picking coins and a masternode, joining,
//! submitting an entry, signing our own inputs of the merged transaction and
//! cleaning up afterwards.

use crate::rounds::mixing_depth;
use crate::wallet::Wallet;
use mix_common::collateral::{COLLATERAL, MIX_FEE};
use mix_common::denomination::{
    classify_values, denominate, describe, is_denominated, smallest_denomination,
};
use mix_common::session::{
    ACCEPTING_TIMEOUT_MS, COMPLETION_RESET_MS, FINALIZE_TIMEOUT_MS, PARTICIPANT_GRACE_MS,
    SIGNING_TIMEOUT_MS,
};
use mix_common::{
    AcceptCode, Amount, DecodedStatus, DenominationMask, Entry, MasternodeDirectory,
    MasternodeInfo, Message, MixError, Network, OutPoint, PeerId, PoolState, QueueAnnouncement,
    QueueBook, QueueRateLimiter, Session, Transaction, TxIn, TxOut, COIN,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Each of the two collateral-sized outputs a split creates.
pub const COLLATERAL_OUTPUT: Amount = COLLATERAL * 5 + MIX_FEE;
/// Smallest selection worth bringing to a round.
pub const MIN_MIX_AMOUNT: Amount = COIN + COIN / 10;
pub const SPLIT_SPACING_BLOCKS: u64 = 10;
/// Splits without a successful round in between before mixing is disabled.
pub const MAX_SPLITS_IN_A_ROW: u32 = 2;
/// Random masternodes tried per session.
pub const MAX_SESSION_TRIES: u32 = 10;
/// Stale coin locks are released on heights divisible by this.
pub const UNLOCK_EVERY_BLOCKS: u64 = 10;
/// A roll out of 100 above this prefers an open queue.
const QUEUE_PREFERENCE: u32 = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixSettings {
    pub enabled: bool,
    /// Coins whose mixing depth is below this are brought to rounds.
    pub rounds: i32,
    pub max_amount: Amount,
    /// Blocks to wait after a successful round.
    pub min_block_spacing: u64,
    /// Start rounds from the periodic task.
    pub auto_mix: bool,
}

impl Default for MixSettings {
    fn default() -> Self {
        MixSettings {
            enabled: true,
            rounds: 2,
            max_amount: 1000 * COIN,
            min_block_spacing: 1,
            auto_mix: true,
        }
    }
}

/// The subset of `coins` that uses exactly the denominations in `denom`.
pub fn coins_matching(
    coins: &[(OutPoint, TxOut)],
    denom: DenominationMask,
) -> Option<Vec<(OutPoint, TxOut)>> {
    if denom == 0 {
        return None;
    }
    let selected: Vec<_> = coins
        .iter()
        .filter(|(_, out)| classify_values([out.value]) & !denom == 0)
        .cloned()
        .collect();
    (classify_values(selected.iter().map(|(_, out)| out.value)) == denom).then_some(selected)
}

pub struct ParticipantSession {
    session: Session,
    network: Network,
    settings: MixSettings,
    wallet: Arc<dyn Wallet>,
    directory: Arc<dyn MasternodeDirectory>,
    masternode: Option<MasternodeInfo>,
    masternodes_used: Vec<OutPoint>,
    tries: u32,
    collateral: Option<Transaction>,
    my_entries: Vec<Entry>,
    locked_coins: Vec<OutPoint>,
    final_tx: Option<Transaction>,
    queue: QueueBook,
    limiter: QueueRateLimiter,
    entries_count: u32,
    last_message: String,
    last_success_height: Option<u64>,
    last_split_height: Option<u64>,
    splits_in_a_row: u32,
    rng: StdRng,
    outbox: Vec<(PeerId, Message)>,
}

impl ParticipantSession {
    pub fn new(
        network: Network,
        settings: MixSettings,
        wallet: Arc<dyn Wallet>,
        directory: Arc<dyn MasternodeDirectory>,
        now_ms: i64,
    ) -> Self {
        ParticipantSession {
            session: Session::new(PoolState::Idle, now_ms),
            network,
            settings,
            wallet,
            directory,
            masternode: None,
            masternodes_used: Vec::new(),
            tries: 0,
            collateral: None,
            my_entries: Vec::new(),
            locked_coins: Vec::new(),
            final_tx: None,
            queue: QueueBook::new(),
            limiter: QueueRateLimiter::new(),
            entries_count: 0,
            last_message: String::new(),
            last_success_height: None,
            last_split_height: None,
            splits_in_a_row: 0,
            rng: StdRng::from_rng(&mut rand::rng()),
            outbox: Vec::new(),
        }
    }

    /// Replaces the source of masternode and queue choices.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
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

    pub fn masternode(&self) -> Option<&MasternodeInfo> {
        self.masternode.as_ref()
    }

    /// Whether `peer` is the masternode this participant submitted to.
    pub fn is_bound_to(&self, peer: &PeerId) -> bool {
        self.masternode
            .as_ref()
            .is_some_and(|mn| mn.address == peer.0)
    }

    pub fn my_entries(&self) -> &[Entry] {
        &self.my_entries
    }

    pub fn entries_count(&self) -> u32 {
        self.entries_count
    }

    pub fn last_message(&self) -> &str {
        &self.last_message
    }

    pub fn locked_coins(&self) -> &[OutPoint] {
        &self.locked_coins
    }

    pub fn masternodes_used(&self) -> &[OutPoint] {
        &self.masternodes_used
    }

    pub fn queue(&self) -> &QueueBook {
        &self.queue
    }

    pub fn limiter(&self) -> &QueueRateLimiter {
        &self.limiter
    }

    pub fn settings(&self) -> &MixSettings {
        &self.settings
    }

    pub fn best_height(&self) -> u64 {
        self.wallet.best_height()
    }

    pub fn wallet(&self) -> &Arc<dyn Wallet> {
        &self.wallet
    }

    /// Operator switch. Re-enabling also forgets earlier splits.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.settings.enabled = enabled;
        if enabled {
            self.splits_in_a_row = 0;
        }
    }

    pub fn take_outbound(&mut self) -> Vec<(PeerId, Message)> {
        std::mem::take(&mut self.outbox)
    }

    fn set_state(&mut self, state: PoolState, now_ms: i64) {
        let previous = self.session.state();
        if self.session.set_state(state, now_ms) {
            debug!("Participant {} -> {}", previous, state);
        }
    }

    fn lock(&mut self, outpoint: OutPoint) {
        self.wallet.lock_coin(outpoint);
        self.locked_coins.push(outpoint);
    }

    pub fn unlock_coins(&mut self) {
        for outpoint in self.locked_coins.drain(..) {
            self.wallet.unlock_coin(&outpoint);
        }
    }

    /// Forgets the round. A hard reset also drops our entries and the
    /// session id.
    pub fn set_null(&mut self, clear_everything: bool, now_ms: i64) {
        self.final_tx = None;
        self.set_state(PoolState::Idle, now_ms);
        self.session.touch(now_ms);
        self.entries_count = 0;
        self.session.denom = 0;
        self.masternode = None;
        self.tries = 0;
        self.collateral = None;
        if clear_everything {
            self.my_entries.clear();
            self.session.session_id = 0;
        }
    }

    /// Denominated coins below the target depth, largest first, capped at
    /// the configured amount.
    pub fn select_mixable_coins(&self) -> Vec<(OutPoint, TxOut)> {
        let mut coins: Vec<_> = self
            .wallet
            .available_coins()
            .into_iter()
            .filter(|(outpoint, out)| {
                is_denominated(out.value)
                    && mixing_depth(self.wallet.as_ref(), outpoint).rounds() < self.settings.rounds
            })
            .collect();
        coins.sort_by(|a, b| b.1.value.cmp(&a.1.value).then(a.0.cmp(&b.0)));

        let mut total = 0;
        let mut selected = Vec::new();
        for coin in coins {
            if total + coin.1.value > self.settings.max_amount {
                continue;
            }
            total += coin.1.value;
            selected.push(coin);
        }
        selected
    }

    fn splittable_balance(&self) -> Amount {
        self.wallet
            .available_coins()
            .iter()
            .filter(|(_, out)| !is_denominated(out.value) && out.value != COLLATERAL_OUTPUT)
            .map(|(_, out)| out.value)
            .sum()
    }

    fn needs_split(&self) -> bool {
        self.splittable_balance() >= smallest_denomination() + 2 * COLLATERAL_OUTPUT
    }

    /// Turns non-denominated funds into two collateral-sized outputs plus,
    /// unless `just_collateral`, standard denominations.
    pub fn split_up_money(&mut self, just_collateral: bool) -> Result<(), MixError> {
        let height = self.wallet.best_height();
        if let Some(last) = self.last_split_height {
            if height.saturating_sub(last) < SPLIT_SPACING_BLOCKS {
                debug!("Split at height {} too soon after {}", height, last);
                return Ok(());
            }
        }
        if self.splits_in_a_row >= MAX_SPLITS_IN_A_ROW {
            error!("Inputs were split repeatedly without a successful round, disabling mixing");
            self.settings.enabled = false;
            return Err(MixError::MixingDisabled(
                "inputs split repeatedly without a successful round".to_string(),
            ));
        }

        let mut values = vec![COLLATERAL_OUTPUT, COLLATERAL_OUTPUT];
        if !just_collateral {
            let spendable: Amount = self
                .wallet
                .available_coins()
                .iter()
                .filter(|(_, out)| !is_denominated(out.value))
                .map(|(_, out)| out.value)
                .sum();
            let (pieces, _) = denominate(spendable - 2 * COLLATERAL_OUTPUT);
            values.extend(pieces);
        }
        let tx = self.wallet.split_up(&values)?;
        self.last_split_height = Some(height);
        self.splits_in_a_row += 1;
        info!(
            "Split funds into {} outputs ({} in a row)",
            tx.outputs.len(),
            self.splits_in_a_row
        );
        Ok(())
    }

    /// Moves the round forward as far as our side can: split funds when
    /// needed, join a masternode, or submit our entry once it reports ready.
    pub fn do_automatic_denominating(
        &mut self,
        dry_run: bool,
        ready: bool,
        now_ms: i64,
    ) -> Result<(), MixError> {
        if self.state().is_terminal() {
            debug!("Round finishing, not mixing");
            return Ok(());
        }
        if let Some(last) = self.last_success_height {
            if self.wallet.best_height().saturating_sub(last) < self.settings.min_block_spacing {
                debug!("Last successful round was too recent");
                return Ok(());
            }
        }
        if !self.settings.enabled {
            return Err(MixError::MixingDisabled("mixing is disabled".to_string()));
        }
        if !dry_run && self.wallet.is_locked() {
            return Err(MixError::WalletError("wallet is locked".to_string()));
        }
        if !self.my_entries.is_empty() {
            return Ok(());
        }

        let candidates = self.select_mixable_coins();
        let total: Amount = candidates.iter().map(|(_, out)| out.value).sum();
        if candidates.is_empty() || total < MIN_MIX_AMOUNT {
            if self.needs_split() {
                if !dry_run {
                    self.split_up_money(false)?;
                }
                return Ok(());
            }
            return Err(MixError::WalletError(
                "no funds in need of mixing".to_string(),
            ));
        }

        if !self.wallet.has_collateral_inputs() {
            if !dry_run {
                self.split_up_money(true)?;
            }
            return Ok(());
        }

        if dry_run {
            return Ok(());
        }

        if self.masternode.is_none() {
            return self.find_masternode(&candidates, now_ms);
        }
        if !ready || self.session.denom == 0 {
            return Ok(());
        }
        self.prepare_denominate(&candidates, now_ms)
    }

    fn find_masternode(
        &mut self,
        candidates: &[(OutPoint, TxOut)],
        now_ms: i64,
    ) -> Result<(), MixError> {
        if self.rng.random_range(0..100u32) > QUEUE_PREFERENCE {
            let open: Vec<QueueAnnouncement> = self
                .queue
                .iter()
                .filter(|q| !q.ready && !self.masternodes_used.contains(&q.vin))
                .cloned()
                .collect();
            for dsq in open {
                if coins_matching(candidates, dsq.denom).is_none() {
                    debug!("No coins for queue {} ({})", dsq.vin, describe(dsq.denom));
                    continue;
                }
                let Some(mn) = self.directory.find(&dsq.vin) else {
                    continue;
                };
                self.queue.consume(&dsq.vin);
                info!("Joining queue of {}", dsq.vin);
                return self.join(mn, dsq.denom, now_ms);
            }
        }

        let denom = classify_values(candidates.iter().map(|(_, out)| out.value));
        let nodes = self.directory.all();
        if nodes.is_empty() {
            return Err(MixError::NetworkError("no masternodes known".to_string()));
        }
        while self.tries < MAX_SESSION_TRIES {
            self.tries += 1;
            let mn = &nodes[self.rng.random_range(0..nodes.len())];
            if self.masternodes_used.contains(&mn.identity)
                || self.limiter.is_throttled(&mn.identity, nodes.len())
            {
                continue;
            }
            info!("Attempt {} with masternode {}", self.tries, mn.address);
            let mn = mn.clone();
            return self.join(mn, denom, now_ms);
        }
        Err(MixError::NetworkError(
            "no masternode available for mixing".to_string(),
        ))
    }

    fn join(
        &mut self,
        mn: MasternodeInfo,
        denom: DenominationMask,
        now_ms: i64,
    ) -> Result<(), MixError> {
        let collateral = match &self.collateral {
            Some(collateral) => collateral.clone(),
            None => {
                let collateral = self.wallet.create_collateral()?;
                self.collateral = Some(collateral.clone());
                collateral
            }
        };
        self.masternodes_used.push(mn.identity);
        self.session.denom = denom;
        self.session.touch(now_ms);
        info!("Asking {} to mix {}", mn.address, describe(denom));
        self.outbox
            .push((PeerId(mn.address.clone()), Message::Dsa { denom, collateral }));
        self.masternode = Some(mn);
        Ok(())
    }

    fn prepare_denominate(
        &mut self,
        candidates: &[(OutPoint, TxOut)],
        now_ms: i64,
    ) -> Result<(), MixError> {
        let coins =
            coins_matching(candidates, self.session.denom).ok_or(MixError::DenominationMismatch)?;
        let inputs = coins.iter().map(|(outpoint, _)| TxIn::new(*outpoint)).collect();
        let outputs = coins
            .iter()
            .map(|(_, out)| TxOut::new(out.value, self.wallet.new_destination()))
            .collect();
        self.send_denominate(inputs, outputs, now_ms)
    }

    /// Locks our coins and collateral and submits them as our entry.
    pub fn send_denominate(
        &mut self,
        inputs: Vec<TxIn>,
        outputs: Vec<TxOut>,
        now_ms: i64,
    ) -> Result<(), MixError> {
        let Some(collateral) = self.collateral.clone() else {
            error!("Submitting an entry without collateral");
            return Err(MixError::CollateralInvalid);
        };
        for input in &collateral.inputs {
            self.lock(input.prevout);
        }
        for input in &inputs {
            self.lock(input.prevout);
        }
        let Some(mn) = self.masternode.clone() else {
            self.unlock_coins();
            self.set_null(true, now_ms);
            return Err(MixError::NetworkError("no masternode selected".to_string()));
        };

        self.set_state(PoolState::AcceptingEntries, now_ms);

        let tx = Transaction::new(inputs.clone(), outputs.clone());
        if let Err(e) = self.wallet.check_acceptable(&tx) {
            warn!("Own entry not acceptable: {}", e);
            self.unlock_coins();
            self.set_null(true, now_ms);
            return Err(e);
        }
        let amount: Amount = inputs
            .iter()
            .filter_map(|i| {
                self.wallet
                    .get_transaction(&i.prevout.txid)
                    .and_then(|tx| tx.outputs.get(i.prevout.vout as usize).map(|o| o.value))
            })
            .sum();

        self.my_entries.push(Entry::new(
            inputs.clone(),
            amount,
            collateral.clone(),
            outputs.clone(),
            now_ms,
        ));
        info!("Submitting {} inputs worth {} to {}", inputs.len(), amount, mn.address);
        self.outbox.push((
            PeerId(mn.address),
            Message::Dsi {
                inputs,
                amount,
                collateral,
                outputs,
            },
        ));
        self.check(now_ms);
        Ok(())
    }

    /// Mirrors a status update from our masternode.
    pub fn status_update(&mut self, status: &DecodedStatus, now_ms: i64) {
        if self.state().is_terminal() {
            return;
        }
        if status.state != PoolState::Unknown {
            self.set_state(status.state, now_ms);
        }
        self.entries_count = status.entries_count;

        match status.accepted {
            AcceptCode::Rejected => {
                warn!("Masternode rejected us: {}", status.error);
                self.set_state(PoolState::Error, now_ms);
                self.last_message = status.error.clone();
                self.my_entries.clear();
                self.unlock_coins();
            }
            AcceptCode::Accepted => {
                self.session.session_id = status.session_id;
                debug!("Session id set to {}", status.session_id);
                if status.state == PoolState::AcceptingEntries {
                    // wait for the others, the masternode reports when ready
                    self.set_state(PoolState::Queue, now_ms);
                }
            }
            AcceptCode::Reset => {}
        }
    }

    /// Signs our inputs of the merged transaction, provided every one of our
    /// entries finds its outputs intact in it.
    pub fn sign_final_transaction(&mut self, tx: Transaction) -> Result<(), MixError> {
        if self.final_tx.is_some() {
            return Err(MixError::WrongState);
        }
        let mn = self
            .masternode
            .clone()
            .ok_or_else(|| MixError::NetworkError("no masternode selected".to_string()))?;

        let mut signed = Vec::new();
        for entry in &self.my_entries {
            for vin in entry.inputs() {
                let Some(index) = tx
                    .inputs
                    .iter()
                    .position(|i| i.prevout == vin.vin.prevout)
                else {
                    continue;
                };
                if !entry.outputs_intact(&tx) {
                    warn!("Merged transaction is missing our outputs, refusing to sign");
                    return Err(MixError::ProtocolViolation(
                        "outputs missing from merged transaction".to_string(),
                        hex::encode(tx.txid()),
                    ));
                }
                let mut input = tx.inputs[index].clone();
                input.script_sig = self.wallet.sign_input(&tx, index)?;
                signed.push(input);
            }
        }
        if signed.is_empty() {
            return Err(MixError::ProtocolViolation(
                "none of our inputs in merged transaction".to_string(),
                hex::encode(tx.txid()),
            ));
        }

        info!("Signed {} inputs of {}", signed.len(), hex::encode(tx.txid()));
        self.final_tx = Some(tx);
        self.outbox
            .push((PeerId(mn.address), Message::Dss { inputs: signed }));
        Ok(())
    }

    pub fn completed_transaction(&mut self, error: bool, message: &str, now_ms: i64) {
        if error {
            warn!("Round failed: {}", message);
            self.set_state(PoolState::Error, now_ms);
        } else {
            info!("Round completed: {}", message);
            self.set_state(PoolState::Success, now_ms);
            if let Some(tx) = &self.final_tx {
                self.wallet.record_transaction(tx);
            }
            self.my_entries.clear();
            self.last_success_height = Some(self.wallet.best_height());
            self.splits_in_a_row = 0;
        }
        self.last_message = message.to_string();
        self.check(now_ms);
        self.unlock_coins();
    }

    /// Leaves a finished round once its outcome has been shown long enough.
    pub fn check(&mut self, now_ms: i64) {
        if self.state().is_terminal() && self.session.elapsed(now_ms) >= COMPLETION_RESET_MS {
            debug!("Leaving {} state", self.state());
            self.set_null(false, now_ms);
            self.unlock_coins();
        }
    }

    pub fn check_timeout(&mut self, now_ms: i64) {
        self.check(now_ms);

        let expired = self.queue.purge_expired(now_ms / 1000);
        if expired > 0 {
            debug!("Dropped {} expired queue announcements", expired);
        }

        let elapsed = self.session.elapsed(now_ms);
        match self.state() {
            PoolState::Idle | PoolState::Queue | PoolState::AcceptingEntries => {
                let before = self.my_entries.len();
                self.my_entries.retain(|e| !e.is_expired(now_ms));
                if self.my_entries.len() < before && self.my_entries.is_empty() {
                    info!("Our entry expired");
                    self.set_null(true, now_ms);
                    self.unlock_coins();
                }
                // a submitted entry stays bound until it expires
                if self.my_entries.is_empty()
                    && elapsed >= ACCEPTING_TIMEOUT_MS + PARTICIPANT_GRACE_MS
                {
                    if self.masternode.is_some() {
                        info!("Masternode went quiet, looking for another");
                    }
                    self.session.touch(now_ms);
                    self.session.denom = 0;
                    self.masternode = None;
                    self.tries = 0;
                    self.unlock_coins();
                    self.set_state(PoolState::Idle, now_ms);
                }
            }
            PoolState::Signing => {
                if elapsed >= SIGNING_TIMEOUT_MS + PARTICIPANT_GRACE_MS {
                    self.timed_out("Signing timed out, please resubmit", now_ms);
                }
            }
            PoolState::FinalizeTransaction | PoolState::Transmission => {
                if elapsed >= FINALIZE_TIMEOUT_MS + PARTICIPANT_GRACE_MS {
                    self.timed_out("Session timed out, please resubmit", now_ms);
                }
            }
            PoolState::Error | PoolState::Success | PoolState::Unknown => {}
        }
    }

    fn timed_out(&mut self, message: &str, now_ms: i64) {
        warn!("{}", message);
        self.set_null(false, now_ms);
        self.unlock_coins();
        self.set_state(PoolState::Error, now_ms);
        self.last_message = message.to_string();
    }

    /// Handles a queue announcement from any masternode.
    pub fn process_queue(&mut self, dsq: QueueAnnouncement, now_ms: i64) -> Result<(), MixError> {
        if dsq.is_expired(now_ms / 1000) {
            debug!("Ignoring expired queue announcement from {}", dsq.vin);
            return Ok(());
        }
        let mn = self
            .directory
            .find(&dsq.vin)
            .ok_or_else(|| MixError::UnknownMasternode(dsq.vin.to_string()))?;
        dsq.check_signature(&mn.public_key, self.network)?;

        if dsq.ready {
            if self.masternode.as_ref().map(|m| m.identity) != Some(dsq.vin) {
                return Ok(());
            }
            info!("Masternode {} is ready", mn.address);
            return self.do_automatic_denominating(false, true, now_ms);
        }

        if self.queue.iter().any(|q| q.vin == dsq.vin && !q.ready) {
            return Ok(());
        }
        if self.limiter.is_throttled(&dsq.vin, self.directory.len()) {
            debug!("Masternode {} is sending too many announcements", dsq.vin);
            return Err(MixError::QueueRateLimited);
        }
        self.limiter.record(dsq.vin);
        debug!("Queue open at {} for {}", mn.address, describe(dsq.denom));
        self.queue.insert(dsq);
        Ok(())
    }

    /// Forgets used masternodes once they make up more than a fifth of the
    /// directory.
    pub fn recycle_used_masternodes(&mut self, directory_size: usize) {
        if self.masternodes_used.len() > directory_size / 5 {
            debug!("Forgetting {} used masternodes", self.masternodes_used.len());
            self.masternodes_used.clear();
        }
    }

    /// Releases coin locks left over outside of a round.
    pub fn new_block(&mut self, height: u64) {
        if height % UNLOCK_EVERY_BLOCKS == 0 && self.my_entries.is_empty() {
            self.unlock_coins();
        }
    }
}
