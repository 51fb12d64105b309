/// Errors raised by the mixing protocol.
///
/// The `Display` text of the protocol-level variants is what a coordinator
/// sends back to a participant in the error field of a status update.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MixError {
    #[error("input not valid")]
    InvalidInput,
    #[error("collateral not valid")]
    CollateralInvalid,
    #[error("entries is full")]
    SessionFull,
    #[error("already have that vin")]
    DuplicateInput,
    #[error("wrong state")]
    WrongState,
    #[error("session not complete!")]
    SessionNotReady,
    #[error("no matching denominations found for mixing")]
    DenominationMismatch,
    #[error("non-standard pubkey detected")]
    NonStandardOutputScript,
    #[error("transaction fees are too high")]
    FeeTooHigh,
    #[error("missing input tx information")]
    MissingReferencedTransaction,
    #[error("transaction not valid: {0}")]
    TransactionRejected(String),
    #[error("Not in the masternode list")]
    NotInMasternodeList,
    #[error("Last queue announcement was too recent")]
    QueueRateLimited,
    #[error("session timed out, please resubmit")]
    SessionTimedOut,
    #[error("no entry for these inputs")]
    UnknownEntry,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Unknown masternode: {0}")]
    UnknownMasternode(String),
    #[error("Mixing disabled: {0}")]
    MixingDisabled(String),
    #[error("Wallet error: {0}")]
    WalletError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Protocol violation: {0} ({1})")]
    ProtocolViolation(String, String),
}
