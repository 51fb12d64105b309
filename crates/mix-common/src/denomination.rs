//! Standard mixing denominations and the bitmask that summarises which of them
//! a set of outputs uses.
//!
//! Bit layout, lowest first:
//!
//! | bit | meaning         |
//! |-----|-----------------|
//! | 0   | 500 COIN + 1    |
//! | 1   | 100 COIN + 1    |
//! | 2   | 10 COIN + 1     |
//! | 3   | 1 COIN + 1      |
//! | 4   | any other value |
//!
//! Two output sets are compatible for mixing iff their masks are equal.

use crate::types::{Amount, TxOut, COIN};

pub type DenominationMask = u32;

/// Ordered largest to smallest. Every node must use the same table.
pub const DENOMINATIONS: [Amount; 4] = [500 * COIN + 1, 100 * COIN + 1, 10 * COIN + 1, COIN + 1];

pub const NON_STANDARD_BIT: DenominationMask = 1 << DENOMINATIONS.len();

/// Every bit a session denomination may carry.
pub const STANDARD_MASK: DenominationMask = NON_STANDARD_BIT - 1;

/// A mask a session can be opened for: at least one standard bit, nothing else.
pub fn is_session_denomination(mask: DenominationMask) -> bool {
    mask != 0 && mask & !STANDARD_MASK == 0
}

/// Bounds the number of outputs a single amount decomposes into.
pub const MAX_PIECES_PER_DENOMINATION: usize = 100;

pub fn smallest_denomination() -> Amount {
    DENOMINATIONS[DENOMINATIONS.len() - 1]
}

pub fn is_denominated(value: Amount) -> bool {
    DENOMINATIONS.contains(&value)
}

/// Mask of the denominations used by `outputs`.
pub fn classify(outputs: &[TxOut]) -> DenominationMask {
    classify_values(outputs.iter().map(|o| o.value))
}

pub fn classify_values<I>(values: I) -> DenominationMask
where
    I: IntoIterator<Item = Amount>,
{
    let mut mask = 0;
    for value in values {
        match DENOMINATIONS.iter().position(|d| *d == value) {
            Some(bit) => mask |= 1 << bit,
            None => mask |= NON_STANDARD_BIT,
        }
    }
    mask
}

/// Greedy decomposition of `amount` into standard denominations.
///
/// Returns the standard pieces and whatever is left over. Negative amounts
/// decompose into nothing.
pub fn denominate(amount: Amount) -> (Vec<Amount>, Amount) {
    let mut left = amount.max(0);
    let mut pieces = Vec::new();
    for denomination in DENOMINATIONS {
        let mut count = 0;
        while left >= denomination && count < MAX_PIECES_PER_DENOMINATION {
            pieces.push(denomination);
            left -= denomination;
            count += 1;
        }
    }
    (pieces, left)
}

/// The decomposition of `amount` with the leftover appended as one
/// non-standard value. Sums to `amount` exactly.
pub fn expand_values(amount: Amount) -> Vec<Amount> {
    let (mut values, left) = denominate(amount);
    if left > 0 {
        values.push(left);
    }
    values
}

/// Mask of the outputs `amount` would be split into.
pub fn expand(amount: Amount) -> DenominationMask {
    classify_values(expand_values(amount))
}

/// Human-readable list of the denominations in `mask`, for logs.
pub fn describe(mask: DenominationMask) -> String {
    let mut parts: Vec<String> = DENOMINATIONS
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, d)| format!("{}", d / COIN))
        .collect();
    if mask & NON_STANDARD_BIT != 0 {
        parts.push("other".to_string());
    }
    parts.join("+")
}
