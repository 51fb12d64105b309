use lazy_static::lazy_static;
use mix_common::denomination::describe;
use mix_common::{
    unix_millis, AcceptCode, Amount, Inbound, MasternodeDirectory, Message, MixError, Network,
    NetworkTrait, PeerId, PROTOCOL_VERSION,
};
use prometheus::{Counter, Encoder, Registry};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod network;
pub mod participant;
pub mod rest_api;
pub mod rounds;
pub mod wallet;

pub use participant::{MixSettings, ParticipantSession};
pub use wallet::{MemoryWallet, Wallet};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref ENTRIES_SUBMITTED: Counter =
        Counter::new("client_entries_submitted_total", "Entries sent to masternodes").unwrap();
    static ref ROUNDS_COMPLETED: Counter =
        Counter::new("client_rounds_completed_total", "Rounds relayed successfully").unwrap();
    static ref ROUNDS_FAILED: Counter =
        Counter::new("client_rounds_failed_total", "Rounds that ended in an error").unwrap();
}

pub fn init_metrics() {
    let collectors: [Box<dyn prometheus::core::Collector>; 3] = [
        Box::new(ENTRIES_SUBMITTED.clone()),
        Box::new(ROUNDS_COMPLETED.clone()),
        Box::new(ROUNDS_FAILED.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            debug!("Metric not registered: {}", e);
        }
    }
}

pub fn metrics_text() -> Result<String, MixError> {
    let mut buffer = Vec::new();
    prometheus::TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| MixError::SerializationError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MixError::SerializationError(e.to_string()))
}

/// Ticks between two directory prunes.
const PRUNE_EVERY_TICKS: u64 = 60;
/// Ticks between two unprompted mixing attempts.
const AUTO_MIX_EVERY_TICKS: u64 = 150;

/// What `/status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: String,
    pub session_id: i32,
    pub denominations: String,
    pub masternode: Option<String>,
    pub entries_count: u32,
    pub my_entries: usize,
    pub locked_coins: usize,
    pub last_message: String,
    pub enabled: bool,
    pub best_height: u64,
    pub available_balance: Amount,
}

/// A wallet taking part in mixing rounds run by masternodes.
pub struct Client {
    network_kind: Network,
    session: Arc<Mutex<ParticipantSession>>,
    network: Arc<Box<dyn NetworkTrait>>,
    directory: Arc<dyn MasternodeDirectory>,
    ticks: AtomicU64,
    last_height: AtomicU64,
}

impl Client {
    pub fn new(
        network: Arc<Box<dyn NetworkTrait>>,
        wallet: Arc<dyn Wallet>,
        directory: Arc<dyn MasternodeDirectory>,
        network_kind: Network,
        settings: MixSettings,
    ) -> Self {
        init_metrics();
        let last_height = wallet.best_height();
        let session = ParticipantSession::new(
            network_kind,
            settings,
            wallet,
            directory.clone(),
            unix_millis(),
        );
        Client {
            network_kind,
            session: Arc::new(Mutex::new(session)),
            network,
            directory,
            ticks: AtomicU64::new(0),
            last_height: AtomicU64::new(last_height),
        }
    }

    pub fn network_kind(&self) -> Network {
        self.network_kind
    }

    pub fn session(&self) -> Arc<Mutex<ParticipantSession>> {
        self.session.clone()
    }

    /// Subscribes to every known masternode, then follows their messages and
    /// drives mixing until the network closes.
    pub async fn run(self: Arc<Self>) -> Result<(), MixError> {
        let mut rx = self.network.subscribe();
        for mn in self.directory.all() {
            let peer = PeerId(mn.address.clone());
            if let Err(e) = self.network.send_to(&peer, Message::Dssub).await {
                warn!("Masternode {} unreachable: {}", peer, e);
            }
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<(PeerId, Message)>>();
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
                    error!("Client delivery queue closed");
                    break;
                }
            }
        });

        info!("Client following {} masternodes", self.directory.len());
        loop {
            match rx.recv().await {
                Ok(inbound) => {
                    let peer = inbound.peer.clone();
                    if let Err(e) = self.handle(inbound).await {
                        warn!("Failed to handle message from {}: {}", peer, e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Client lagged, {} messages dropped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
        Ok(())
    }

    /// One pass of the periodic housekeeping, returning what must be sent.
    pub async fn tick(&self, now_ms: i64) -> Vec<(PeerId, Message)> {
        let ticks = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let mut session = self.session.lock().await;

        if ticks % PRUNE_EVERY_TICKS == 0 {
            let pruned = self.directory.prune_inactive();
            if pruned > 0 {
                info!("Pruned {} inactive masternodes", pruned);
            }
            session.recycle_used_masternodes(self.directory.len());
        }

        let height = session.best_height();
        if self.last_height.swap(height, Ordering::SeqCst) != height {
            session.new_block(height);
        }

        session.check_timeout(now_ms);

        let settings = *session.settings();
        if settings.enabled && settings.auto_mix && (ticks - 1) % AUTO_MIX_EVERY_TICKS == 0 {
            if let Err(e) = session.do_automatic_denominating(false, false, now_ms) {
                debug!("Automatic mixing skipped: {}", e);
            }
        }
        session.take_outbound()
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

        let mut session = self.session.lock().await;
        let result = match envelope.message {
            Message::Dsq(dsq) => session.process_queue(dsq, now),
            Message::Dssu(update) => {
                if !session.is_bound_to(&peer) {
                    return Ok(());
                }
                let status = update.decode()?;
                if status.accepted == AcceptCode::Reset
                    && status.session_id != session.session_id()
                {
                    debug!("Status of session {} is not ours", status.session_id);
                } else {
                    session.status_update(&status, now);
                }
                Ok(())
            }
            Message::Dsf { session_id, tx } => {
                if !session.is_bound_to(&peer) || session_id != session.session_id() {
                    debug!("Merged transaction for session {} is not ours", session_id);
                    return Ok(());
                }
                session.sign_final_transaction(tx)
            }
            Message::Dsc {
                session_id,
                error,
                message,
            } => {
                if !session.is_bound_to(&peer) || session_id != session.session_id() {
                    debug!("Completion of session {} is not ours", session_id);
                    return Ok(());
                }
                if error {
                    ROUNDS_FAILED.inc();
                } else {
                    ROUNDS_COMPLETED.inc();
                }
                session.completed_transaction(error, &message, now);
                Ok(())
            }
            other => {
                warn!("Client received unexpected {} message", other.tag());
                Ok(())
            }
        };

        let batch = session.take_outbound();
        drop(session);
        self.deliver(batch).await;
        result
    }

    /// Runs one mixing attempt right away.
    pub async fn mix_now(&self) -> Result<StatusReport, MixError> {
        let mut session = self.session.lock().await;
        let result = session.do_automatic_denominating(false, false, unix_millis());
        let batch = session.take_outbound();
        drop(session);
        self.deliver(batch).await;
        result?;
        Ok(self.status().await)
    }

    pub async fn set_enabled(&self, enabled: bool) -> StatusReport {
        self.session.lock().await.set_enabled(enabled);
        info!("Mixing {}", if enabled { "enabled" } else { "disabled" });
        self.status().await
    }

    pub async fn status(&self) -> StatusReport {
        let session = self.session.lock().await;
        StatusReport {
            state: session.state().to_string(),
            session_id: session.session_id(),
            denominations: describe(session.denom()),
            masternode: session.masternode().map(|mn| mn.address.clone()),
            entries_count: session.entries_count(),
            my_entries: session.my_entries().len(),
            locked_coins: session.locked_coins().len(),
            last_message: session.last_message().to_string(),
            enabled: session.settings().enabled,
            best_height: session.best_height(),
            available_balance: session
                .wallet()
                .available_coins()
                .iter()
                .map(|(_, out)| out.value)
                .sum(),
        }
    }

    async fn deliver(&self, batch: Vec<(PeerId, Message)>) {
        for (peer, message) in batch {
            if matches!(message, Message::Dsi { .. }) {
                ENTRIES_SUBMITTED.inc();
            }
            if let Err(e) = self.network.send_to(&peer, message).await {
                warn!("Failed to deliver message to {}: {}", peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_exposed() {
        init_metrics();
        init_metrics();
        ROUNDS_COMPLETED.inc_by(0.0);
        let text = metrics_text().unwrap();
        assert!(text.contains("client_rounds_completed_total"));
    }
}
