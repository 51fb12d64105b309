use crate::denomination::DenominationMask;
use crate::errors::MixError;
use crate::queue::QueueAnnouncement;
use crate::session::{AcceptCode, PoolState};
use crate::types::{Amount, Transaction, TxIn, TxOut};
use async_trait::async_trait;
use bincode::{Decode, Encode};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::{
    tungstenite::{self, Message as TungMessage},
    WebSocketStream,
};
use tracing::{debug, warn};

/// Messages from peers speaking any other version are dropped.
pub const PROTOCOL_VERSION: u32 = 70045;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Envelope {
    pub version: u32,
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Envelope {
            version: PROTOCOL_VERSION,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Message {
    /// Ask a masternode to open or join a round.
    Dsa {
        denom: DenominationMask,
        collateral: Transaction,
    },
    /// Submit inputs and outputs.
    Dsi {
        inputs: Vec<TxIn>,
        amount: Amount,
        collateral: Transaction,
        outputs: Vec<TxOut>,
    },
    Dsq(QueueAnnouncement),
    /// Signatures for own inputs of the merged transaction.
    Dss { inputs: Vec<TxIn> },
    /// The merged transaction to sign.
    Dsf { session_id: i32, tx: Transaction },
    /// Round completed, successfully or not.
    Dsc {
        session_id: i32,
        error: bool,
        message: String,
    },
    Dssu(StatusUpdate),
    /// Request a status update.
    Dssub,
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Dsa { .. } => "dsa",
            Message::Dsi { .. } => "dsi",
            Message::Dsq(_) => "dsq",
            Message::Dss { .. } => "dss",
            Message::Dsf { .. } => "dsf",
            Message::Dsc { .. } => "dsc",
            Message::Dssu(_) => "dssu",
            Message::Dssub => "dssub",
        }
    }
}

/// Status update exactly as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StatusUpdate {
    pub session_id: i32,
    pub state: u32,
    pub entries_count: u32,
    pub accepted: i32,
    pub error: String,
}

/// A status update with its state and accept code decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStatus {
    pub session_id: i32,
    pub state: PoolState,
    pub entries_count: u32,
    pub accepted: AcceptCode,
    pub error: String,
}

impl StatusUpdate {
    pub fn new(
        session_id: i32,
        state: PoolState,
        entries_count: usize,
        accepted: AcceptCode,
        error: impl Into<String>,
    ) -> Self {
        StatusUpdate {
            session_id,
            state: state.to_wire(),
            entries_count: entries_count as u32,
            accepted: accepted.to_wire(),
            error: error.into(),
        }
    }

    pub fn decode(&self) -> Result<DecodedStatus, MixError> {
        let accepted = AcceptCode::from_wire(self.accepted).ok_or_else(|| {
            MixError::ProtocolViolation(
                "unknown accept code".to_string(),
                self.accepted.to_string(),
            )
        })?;
        Ok(DecodedStatus {
            session_id: self.session_id,
            state: PoolState::from_wire(self.state),
            entries_count: self.entries_count,
            accepted,
            error: self.error.clone(),
        })
    }
}

/// Identifies the connection a message arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Inbound {
    pub peer: PeerId,
    pub envelope: Envelope,
}

pub type WsSink<S> = SplitSink<WebSocketStream<S>, TungMessage>;

/// Core network functionality for sending and receiving protocol messages.
#[async_trait]
pub trait NetworkTrait: Send + Sync {
    async fn send_to(&self, peer: &PeerId, message: Message) -> Result<(), MixError>;
    async fn broadcast(&self, message: Message) -> Result<(), MixError>;
    fn subscribe(&self) -> broadcast::Receiver<Inbound>;
    async fn listen(&self, address: &str) -> Result<(), MixError>;
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, MixError> {
    bincode::encode_to_vec(envelope, bincode::config::standard())
        .map_err(|e| MixError::SerializationError(e.to_string()))
}

pub fn decode_envelope(data: &[u8]) -> Result<Envelope, MixError> {
    bincode::decode_from_slice(data, bincode::config::standard())
        .map(|(envelope, _)| envelope)
        .map_err(|e| MixError::SerializationError(e.to_string()))
}

pub async fn handle_connection<S>(
    mut read: SplitStream<WebSocketStream<S>>,
    peer: PeerId,
    tx: broadcast::Sender<Inbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(Ok(msg)) = read.next().await {
        if let tungstenite::Message::Binary(data) = msg {
            match decode_envelope(&data) {
                Ok(envelope) => {
                    debug!("Received {} from {}", envelope.message.tag(), peer);
                    let inbound = Inbound {
                        peer: peer.clone(),
                        envelope,
                    };
                    if tx.send(inbound).is_err() {
                        tracing::error!("Failed to send message to channel");
                        break;
                    }
                }
                Err(e) => warn!("Failed to deserialize message from {}: {}", peer, e),
            }
        }
    }
    debug!("Connection to {} closed", peer);
}

pub async fn send_message_to_peer<S>(sink: &mut WsSink<S>, message: Message) -> Result<(), MixError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let data = encode_envelope(&Envelope::new(message))?;
    sink.send(tungstenite::protocol::Message::Binary(data.into()))
        .await
        .map_err(|e| MixError::NetworkError(e.to_string()))?;
    Ok(())
}
