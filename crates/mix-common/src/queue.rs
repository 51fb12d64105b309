//! Queue announcements: how a coordinator advertises an open round, plus the
//! bookkeeping both roles keep about them.

use crate::config::Network;
use crate::crypto::Crypto;
use crate::denomination::DenominationMask;
use crate::errors::MixError;
use crate::types::OutPoint;
use bincode::{Decode, Encode};
use ed25519_dalek::VerifyingKey as PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Announcements older than this are ignored and purged.
pub const QUEUE_TIMEOUT_SECS: i64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct QueueAnnouncement {
    pub denom: DenominationMask,
    /// Identity input of the announcing masternode.
    pub vin: OutPoint,
    /// unix seconds
    pub time: i64,
    pub ready: bool,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl QueueAnnouncement {
    pub fn new(denom: DenominationMask, vin: OutPoint, time: i64, ready: bool) -> Self {
        QueueAnnouncement {
            denom,
            vin,
            time,
            ready,
            signature: Vec::new(),
        }
    }

    pub fn signing_payload(&self) -> String {
        format!(
            "{}{}{}{}",
            self.vin,
            self.denom,
            self.time,
            u8::from(self.ready)
        )
    }

    pub fn sign(&mut self, crypto: &Crypto, network: Network) {
        self.signature = crypto.sign_message(network, &self.signing_payload());
    }

    pub fn check_signature(
        &self,
        public_key: &PublicKey,
        network: Network,
    ) -> Result<(), MixError> {
        Crypto::verify_message(network, public_key, &self.signature, &self.signing_payload())
    }

    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs - self.time > QUEUE_TIMEOUT_SECS
    }
}

/// Throttles masternodes that announce more often than their share.
///
/// Every non-ready announcement bumps a global counter. A masternode is
/// throttled while its last announcement is within `directory_size / 5`
/// announcements of the current count.
#[derive(Debug, Default, Clone)]
pub struct QueueRateLimiter {
    count: u64,
    last: HashMap<OutPoint, u64>,
}

impl QueueRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_throttled(&self, identity: &OutPoint, directory_size: usize) -> bool {
        match self.last.get(identity) {
            Some(&last) if last != 0 => last + (directory_size as u64) / 5 > self.count,
            _ => false,
        }
    }

    pub fn record(&mut self, identity: OutPoint) {
        self.count += 1;
        self.last.insert(identity, self.count);
    }
}

/// Live announcements as seen by a participant, one per masternode.
#[derive(Debug, Default, Clone)]
pub struct QueueBook {
    announcements: Vec<QueueAnnouncement>,
}

impl QueueBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `dsq`, returning false when an announcement from the same
    /// masternode with the same readiness is already held.
    pub fn insert(&mut self, dsq: QueueAnnouncement) -> bool {
        if self
            .announcements
            .iter()
            .any(|q| q.vin == dsq.vin && q.ready == dsq.ready)
        {
            return false;
        }
        self.announcements.retain(|q| q.vin != dsq.vin);
        self.announcements.push(dsq);
        true
    }

    pub fn purge_expired(&mut self, now_secs: i64) -> usize {
        let before = self.announcements.len();
        self.announcements.retain(|q| !q.is_expired(now_secs));
        before - self.announcements.len()
    }

    /// Drops the announcement of `vin`, once acted upon.
    pub fn consume(&mut self, vin: &OutPoint) -> Option<QueueAnnouncement> {
        let index = self.announcements.iter().position(|q| q.vin == *vin)?;
        Some(self.announcements.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueAnnouncement> {
        self.announcements.iter()
    }

    /// Open announcements for `denom`, oldest first.
    pub fn open_for(&self, denom: DenominationMask) -> Vec<&QueueAnnouncement> {
        self.announcements
            .iter()
            .filter(|q| !q.ready && q.denom == denom)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.announcements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announcements.is_empty()
    }
}
