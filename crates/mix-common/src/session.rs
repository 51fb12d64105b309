use crate::denomination::DenominationMask;
use bincode::{Decode, Encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinator: queue or accepting phase without progress.
pub const ACCEPTING_TIMEOUT_MS: i64 = 30_000;
/// Coordinator: finalize or transmission phase without progress.
pub const FINALIZE_TIMEOUT_MS: i64 = 30_000;
pub const SIGNING_TIMEOUT_MS: i64 = 10_000;
/// Extra patience participants allow before giving up on a coordinator.
pub const PARTICIPANT_GRACE_MS: i64 = 10_000;
/// How long a participant shows a terminal state before resetting.
pub const COMPLETION_RESET_MS: i64 = 10_000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Encode, Decode,
)]
pub enum PoolState {
    Unknown,
    #[default]
    Idle,
    Queue,
    AcceptingEntries,
    FinalizeTransaction,
    Signing,
    Transmission,
    Error,
    Success,
}

impl PoolState {
    pub fn to_wire(self) -> u32 {
        match self {
            PoolState::Unknown => 0,
            PoolState::Idle => 1,
            PoolState::Queue => 2,
            PoolState::AcceptingEntries => 3,
            PoolState::FinalizeTransaction => 4,
            PoolState::Signing => 5,
            PoolState::Transmission => 6,
            PoolState::Error => 7,
            PoolState::Success => 8,
        }
    }

    /// Out of range values decode as `Unknown`.
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => PoolState::Idle,
            2 => PoolState::Queue,
            3 => PoolState::AcceptingEntries,
            4 => PoolState::FinalizeTransaction,
            5 => PoolState::Signing,
            6 => PoolState::Transmission,
            7 => PoolState::Error,
            8 => PoolState::Success,
            _ => PoolState::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PoolState::Error | PoolState::Success)
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Unknown => "UNKNOWN",
            PoolState::Idle => "IDLE",
            PoolState::Queue => "QUEUE",
            PoolState::AcceptingEntries => "ACCEPTING_ENTRIES",
            PoolState::FinalizeTransaction => "FINALIZE_TRANSACTION",
            PoolState::Signing => "SIGNING",
            PoolState::Transmission => "TRANSMISSION",
            PoolState::Error => "ERROR",
            PoolState::Success => "SUCCESS",
        };
        f.write_str(name)
    }
}

/// Outcome attached to a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptCode {
    /// A plain state notification.
    Reset,
    Rejected,
    Accepted,
}

impl AcceptCode {
    pub fn to_wire(self) -> i32 {
        match self {
            AcceptCode::Reset => -1,
            AcceptCode::Rejected => 0,
            AcceptCode::Accepted => 1,
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            -1 => Some(AcceptCode::Reset),
            0 => Some(AcceptCode::Rejected),
            1 => Some(AcceptCode::Accepted),
            _ => None,
        }
    }
}

/// State shared by both roles' view of a round.
#[derive(Debug, Clone)]
pub struct Session {
    state: PoolState,
    pub session_id: i32,
    pub denom: DenominationMask,
    last_state_change_ms: i64,
    shuffle_seed: [u8; 32],
}

impl Session {
    pub fn new(initial: PoolState, now_ms: i64) -> Self {
        let mut session = Session {
            state: initial,
            session_id: 0,
            denom: 0,
            last_state_change_ms: now_ms,
            shuffle_seed: [0u8; 32],
        };
        session.reseed();
        session
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Moves to `state`, returning whether anything changed.
    pub fn set_state(&mut self, state: PoolState, now_ms: i64) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.last_state_change_ms = now_ms;
        true
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_state_change_ms = now_ms;
    }

    pub fn elapsed(&self, now_ms: i64) -> i64 {
        now_ms - self.last_state_change_ms
    }

    pub fn last_state_change(&self) -> i64 {
        self.last_state_change_ms
    }

    pub fn shuffle_seed(&self) -> [u8; 32] {
        self.shuffle_seed
    }

    pub fn reseed(&mut self) {
        rand::rng().fill_bytes(&mut self.shuffle_seed);
    }
}
