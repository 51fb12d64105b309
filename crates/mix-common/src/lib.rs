pub mod chain;
pub mod collateral;
pub mod config;
pub mod crypto;
pub mod denomination;
pub mod entry;
pub mod errors;
pub mod network;
pub mod queue;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod types;

pub use chain::*;
pub use config::{FeePolicy, Network};
pub use crypto::Crypto;
pub use denomination::DenominationMask;
pub use entry::{Entry, EntryLedger, EntryVin};
pub use errors::MixError;
pub use network::*;
pub use queue::{QueueAnnouncement, QueueBook, QueueRateLimiter};
pub use session::{AcceptCode, PoolState, Session};
pub use types::*;
