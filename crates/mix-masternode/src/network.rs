use futures_util::{stream::StreamExt, SinkExt};
use mix_common::{
    handle_connection, send_message_to_peer, Inbound, Message, MixError, NetworkTrait, PeerId,
    WsSink,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::{
    net::TcpStream,
    sync::{broadcast, RwLock},
    time::Duration,
};
use tokio_tungstenite::{accept_async, tungstenite::Message as TungMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Peers = Arc<RwLock<HashMap<PeerId, WsSink<TcpStream>>>>;

/// Network implementation for masternodes, which only accept connections.
pub struct MasternodeNetwork {
    tx: broadcast::Sender<Inbound>,
    peers: Peers,
    heartbeat_interval: Duration,
}

impl Default for MasternodeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MasternodeNetwork {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self {
            tx,
            heartbeat_interval: Duration::from_secs(5),
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Pings every peer periodically and forgets the ones that are gone.
    pub fn start_heartbeat(&self) {
        let peers = self.peers.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                let mut peers = peers.write().await;
                let mut disconnected = Vec::new();
                for (peer, sink) in peers.iter_mut() {
                    if sink.send(TungMessage::Ping(Vec::<u8>::new().into())).await.is_err() {
                        disconnected.push(peer.clone());
                    }
                }
                for peer in disconnected {
                    peers.remove(&peer);
                    info!("Peer {} stopped responding", peer);
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl NetworkTrait for MasternodeNetwork {
    async fn send_to(&self, peer: &PeerId, message: Message) -> Result<(), MixError> {
        let mut peers = self.peers.write().await;
        let sink = peers
            .get_mut(peer)
            .ok_or_else(|| MixError::NetworkError(format!("Unknown peer {}", peer)))?;
        let result = send_message_to_peer(sink, message).await;
        if result.is_err() {
            peers.remove(peer);
        }
        result
    }

    async fn broadcast(&self, message: Message) -> Result<(), MixError> {
        let mut peers = self.peers.write().await;
        let mut disconnected = Vec::new();

        for (peer, peer_sink) in peers.iter_mut() {
            if let Err(e) = send_message_to_peer(peer_sink, message.clone()).await {
                warn!("Failed to send to peer {}: {}", peer, e);
                disconnected.push(peer.clone());
            }
        }

        for peer in disconnected {
            peers.remove(&peer);
            info!("Peer {} disconnected", peer);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.tx.subscribe()
    }

    async fn listen(&self, address: &str) -> Result<(), MixError> {
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .map_err(|e| MixError::NetworkError(e.to_string()))?;

        let tx = self.tx.clone();
        let peers = self.peers.clone();

        tokio::spawn(async move {
            while let Ok((stream, remote)) = listener.accept().await {
                let tx = tx.clone();
                let peers = peers.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws_stream) => {
                            let peer = PeerId(Uuid::new_v4().to_string());
                            debug!("Peer {} connected from {}", peer, remote);
                            let (write, read) = ws_stream.split();
                            peers.write().await.insert(peer.clone(), write);

                            handle_connection(read, peer.clone(), tx).await;
                            peers.write().await.remove(&peer);
                        }
                        Err(e) => warn!("Websocket handshake with {} failed: {}", remote, e),
                    }
                });
            }
        });

        self.start_heartbeat();

        info!("WebSocket server listening on {}", address);
        Ok(())
    }
}
