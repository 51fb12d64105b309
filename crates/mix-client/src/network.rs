use async_trait::async_trait;
use futures_util::StreamExt;
use mix_common::{
    handle_connection, send_message_to_peer, Inbound, Message, MixError, NetworkTrait, PeerId,
    WsSink,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tracing::{info, warn};

type Peers = Arc<RwLock<HashMap<PeerId, WsSink<MaybeTlsStream<TcpStream>>>>>;

/// Outgoing websocket connections to masternodes, keyed by their url.
#[derive(Clone)]
pub struct ClientNetwork {
    peers: Peers,
    // propagates incoming messages to all subscribers
    tx: broadcast::Sender<Inbound>,
}

impl Default for ClientNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientNetwork {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            tx,
        }
    }

    /// Connects to the masternode at `url`. Messages it sends are published
    /// with the url as peer id, and the connection is forgotten once closed.
    pub async fn connect(&self, url: &str) -> Result<(), MixError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| MixError::NetworkError(format!("{}: {}", url, e)))?;
        let (sink, stream) = ws_stream.split();
        let peer = PeerId(url.to_string());
        self.peers.write().await.insert(peer.clone(), sink);
        info!("Connected to masternode {}", peer);

        let tx = self.tx.clone();
        let peers = self.peers.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer.clone(), tx).await;
            peers.write().await.remove(&peer);
            info!("Connection to masternode {} closed", peer);
        });
        Ok(())
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.read().await.contains_key(peer)
    }
}

#[async_trait]
impl NetworkTrait for ClientNetwork {
    /// Connects first when there is no open connection to `peer`.
    async fn send_to(&self, peer: &PeerId, message: Message) -> Result<(), MixError> {
        if !self.is_connected(peer).await {
            self.connect(&peer.0).await?;
        }
        let mut peers = self.peers.write().await;
        let sink = peers
            .get_mut(peer)
            .ok_or_else(|| MixError::NetworkError("Connection dropped (WsSink)".to_string()))?;
        let result = send_message_to_peer(sink, message).await;
        if result.is_err() {
            peers.remove(peer);
        }
        result
    }

    async fn broadcast(&self, message: Message) -> Result<(), MixError> {
        let mut peers = self.peers.write().await;
        let mut disconnected = Vec::new();

        for (peer, sink) in peers.iter_mut() {
            if let Err(e) = send_message_to_peer(sink, message.clone()).await {
                warn!("Failed to send to masternode {}: {}", peer, e);
                disconnected.push(peer.clone());
            }
        }
        for peer in disconnected {
            peers.remove(&peer);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.tx.subscribe()
    }

    // The client does not accept incoming connections.
    async fn listen(&self, _address: &str) -> Result<(), MixError> {
        Ok(())
    }
}
