use lazy_static::lazy_static;
use mix_common::crypto::is_associated_with_identity;
use mix_common::{
    unix_millis, Crypto, FeePolicy, Inbound, MasternodeDirectory, Message, MixError, Network,
    NetworkTrait, OutPoint, PeerId, QueueAnnouncement, TransactionLayer, PROTOCOL_VERSION,
};
use prometheus::{Counter, Encoder, Gauge, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod coordinator;
pub mod network;

pub use coordinator::CoordinatorSession;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref ENTRIES: Gauge =
        Gauge::new("masternode_entries", "Entries admitted to the current session").unwrap();
    static ref FORFEITS: Counter =
        Counter::new("masternode_forfeits_total", "Collateral transactions charged").unwrap();
    static ref ROUNDS_TRANSMITTED: Counter =
        Counter::new("masternode_rounds_transmitted_total", "Merged transactions relayed").unwrap();
    static ref ROUNDS_FAILED: Counter =
        Counter::new("masternode_rounds_failed_total", "Merged transactions rejected").unwrap();
}

pub fn init_metrics() {
    let collectors: [Box<dyn prometheus::core::Collector>; 4] = [
        Box::new(ENTRIES.clone()),
        Box::new(FORFEITS.clone()),
        Box::new(ROUNDS_TRANSMITTED.clone()),
        Box::new(ROUNDS_FAILED.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            debug!("Metric not registered: {}", e);
        }
    }
}

/// Text exposition of the masternode metrics.
pub fn metrics_text() -> Result<String, MixError> {
    let mut buffer = Vec::new();
    prometheus::TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| MixError::SerializationError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MixError::SerializationError(e.to_string()))
}

/// Ticks between two directory prunes.
const PRUNE_EVERY_TICKS: u64 = 60;

/// A message waiting to be written to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(Message),
    Reply(PeerId, Message),
}

/// A masternode serving mixing sessions to participants.
pub struct Masternode {
    identity: OutPoint,
    network_kind: Network,
    session: Arc<Mutex<CoordinatorSession>>,
    network: Arc<Box<dyn NetworkTrait>>,
    directory: Arc<dyn MasternodeDirectory>,
    ticks: AtomicU64,
}

impl Masternode {
    /// Fails when `identity` does not lock the masternode collateral to the
    /// key of `crypto`.
    pub fn new(
        network: Arc<Box<dyn NetworkTrait>>,
        crypto: Crypto,
        identity: OutPoint,
        layer: Arc<dyn TransactionLayer>,
        directory: Arc<dyn MasternodeDirectory>,
        network_kind: Network,
        fee_policy: FeePolicy,
    ) -> Result<Self, MixError> {
        if !is_associated_with_identity(layer.as_ref(), &identity, &crypto.public_key()) {
            return Err(MixError::ConfigError(format!(
                "identity input {} is not associated with the masternode key",
                identity
            )));
        }
        init_metrics();
        let session = CoordinatorSession::new(
            network_kind,
            fee_policy,
            identity,
            crypto,
            layer,
            unix_millis(),
        );
        Ok(Masternode {
            identity,
            network_kind,
            session: Arc::new(Mutex::new(session)),
            network,
            directory,
            ticks: AtomicU64::new(0),
        })
    }

    pub fn identity(&self) -> OutPoint {
        self.identity
    }

    pub fn session(&self) -> Arc<Mutex<CoordinatorSession>> {
        self.session.clone()
    }

    /// Listens for participants and serves them until the network closes.
    pub async fn run(self: Arc<Self>, address: &str) -> Result<(), MixError> {
        self.network.listen(address).await?;
        let mut rx = self.network.subscribe();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<Outbound>>();
        let courier = self.clone();
        tokio::spawn(async move {
            while let Some(batch) = out_rx.recv().await {
                courier.deliver(batch).await;
            }
        });

        let ticker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));
            loop {
                interval.tick().await;
                let batch = ticker.tick(unix_millis()).await;
                if !batch.is_empty() && out_tx.send(batch).is_err() {
                    error!("Masternode delivery queue closed");
                    break;
                }
            }
        });

        info!("Masternode {} serving sessions", self.identity);
        loop {
            match rx.recv().await {
                Ok(inbound) => {
                    let peer = inbound.peer.clone();
                    if let Err(e) = self.handle(inbound).await {
                        warn!("Failed to handle message from {}: {}", peer, e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Masternode lagged, {} messages dropped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
        Ok(())
    }

    /// One pass of the periodic housekeeping, returning what must be sent.
    pub async fn tick(&self, now_ms: i64) -> Vec<Outbound> {
        let ticks = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if ticks % PRUNE_EVERY_TICKS == 0 {
            let pruned = self.directory.prune_inactive();
            if pruned > 0 {
                info!("Pruned {} inactive masternodes", pruned);
            }
        }
        let mut session = self.session.lock().await;
        session.check_timeout(now_ms);
        session
            .take_outbound()
            .into_iter()
            .map(Outbound::Broadcast)
            .collect()
    }

    /// Handles one inbound message and delivers whatever it produced.
    pub async fn handle(&self, inbound: Inbound) -> Result<(), MixError> {
        let Inbound { peer, envelope } = inbound;
        if envelope.version != PROTOCOL_VERSION {
            debug!(
                "Dropping {} from {} with version {}",
                envelope.message.tag(),
                peer,
                envelope.version
            );
            return Ok(());
        }
        let now = unix_millis();

        let batch = match envelope.message {
            Message::Dsa { denom, collateral } => {
                let mut session = self.session.lock().await;
                let result = if self.directory.find(&self.identity).is_none() {
                    Err(MixError::NotInMasternodeList)
                } else if session.session_users() == 0
                    && session
                        .limiter()
                        .is_throttled(&self.identity, self.directory.len())
                {
                    Err(MixError::QueueRateLimited)
                } else {
                    session.is_compatible_with_session(denom, &collateral, now)
                };
                match &result {
                    Ok(()) => {
                        info!("Peer {} joined session {}", peer, session.session_id());
                        session.check(now);
                    }
                    Err(e) => info!("Peer {} refused: {}", peer, e),
                }
                let reply = Message::Dssu(session.status_reply(&result));
                Self::reply_then_broadcast(peer, reply, session.take_outbound())
            }
            Message::Dsi {
                inputs,
                amount,
                collateral,
                outputs,
            } => {
                let mut session = self.session.lock().await;
                let result = session.submit_entry(inputs, amount, collateral, outputs, now);
                if let Err(e) = &result {
                    info!("Entry from {} rejected: {}", peer, e);
                }
                let reply = Message::Dssu(session.status_reply(&result));
                Self::reply_then_broadcast(peer, reply, session.take_outbound())
            }
            Message::Dss { inputs } => {
                let mut session = self.session.lock().await;
                if !session.has_entry_for(&inputs) {
                    info!("Signatures from {} match no entry", peer);
                    let reply = session.status(
                        mix_common::AcceptCode::Rejected,
                        MixError::UnknownEntry.to_string(),
                    );
                    vec![Outbound::Reply(peer, Message::Dssu(reply))]
                } else {
                    if !session.add_signatures(&inputs, now) {
                        warn!("Signatures from {} not accepted", peer);
                    }
                    session
                        .take_outbound()
                        .into_iter()
                        .map(Outbound::Broadcast)
                        .collect()
                }
            }
            Message::Dssub => {
                let session = self.session.lock().await;
                let reply = session.status(mix_common::AcceptCode::Reset, "");
                vec![Outbound::Reply(peer, Message::Dssu(reply))]
            }
            Message::Dsq(dsq) => {
                self.record_queue(&dsq).await;
                Vec::new()
            }
            other => {
                warn!("Masternode received unexpected {} message", other.tag());
                Vec::new()
            }
        };

        self.deliver(batch).await;
        Ok(())
    }

    fn reply_then_broadcast(peer: PeerId, reply: Message, outbox: Vec<Message>) -> Vec<Outbound> {
        std::iter::once(Outbound::Reply(peer, reply))
            .chain(outbox.into_iter().map(Outbound::Broadcast))
            .collect()
    }

    /// Counts another masternode's open announcement towards the rate limit.
    async fn record_queue(&self, dsq: &QueueAnnouncement) {
        if dsq.ready {
            return;
        }
        let Some(mn) = self.directory.find(&dsq.vin) else {
            debug!("Queue announcement from unknown masternode {}", dsq.vin);
            return;
        };
        if let Err(e) = dsq.check_signature(&mn.public_key, self.network_kind) {
            warn!("Queue announcement from {} failed verification: {}", dsq.vin, e);
            return;
        }
        let mut session = self.session.lock().await;
        let limiter = session.limiter_mut();
        if limiter.is_throttled(&dsq.vin, self.directory.len()) {
            debug!("Masternode {} is sending too many announcements", dsq.vin);
            return;
        }
        limiter.record(dsq.vin);
    }

    async fn deliver(&self, batch: Vec<Outbound>) {
        for outbound in batch {
            let result = match outbound {
                Outbound::Broadcast(message) => self.network.broadcast(message).await,
                Outbound::Reply(peer, message) => self.network.send_to(&peer, message).await,
            };
            if let Err(e) = result {
                warn!("Failed to deliver message: {}", e);
            }
        }
    }
}
