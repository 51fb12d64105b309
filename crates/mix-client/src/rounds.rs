//! How many mixing rounds a coin has been through, found by walking its
//! ancestry back through the wallet's own inputs.

use crate::wallet::Wallet;
use mix_common::collateral::MIX_FEE;
use mix_common::denomination::is_denominated;
use mix_common::OutPoint;

/// Ancestry is never followed further back than this.
pub const MAX_ROUNDS_DEPTH: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixDepth {
    /// The coin points past the end of its transaction's outputs.
    InvalidOutput,
    /// A fee-sized output, never mixed.
    FeeOutput,
    /// The coin itself is not a standard denomination.
    NotDenominated,
    /// The walk stopped at a transaction without denominated outputs, or at
    /// the depth bound.
    Rounds(i32),
    /// The walk ran out of ancestors the wallet knows about at this depth.
    AncestorMissing(i32),
}

impl MixDepth {
    /// Numeric form: negative values for coins that cannot count as mixed.
    pub fn rounds(self) -> i32 {
        match self {
            MixDepth::InvalidOutput => -4,
            MixDepth::FeeOutput => -3,
            MixDepth::NotDenominated => -2,
            MixDepth::Rounds(n) => n,
            MixDepth::AncestorMissing(n) => n - 1,
        }
    }
}

enum Step {
    Done(MixDepth),
    Descend(Vec<OutPoint>),
}

fn step(wallet: &dyn Wallet, coin: &OutPoint, rounds: i32) -> Step {
    if rounds >= MAX_ROUNDS_DEPTH {
        return Step::Done(MixDepth::Rounds(rounds));
    }
    let Some(tx) = wallet.get_transaction(&coin.txid) else {
        return Step::Done(MixDepth::AncestorMissing(rounds));
    };
    let Some(out) = tx.outputs.get(coin.vout as usize) else {
        return Step::Done(MixDepth::InvalidOutput);
    };
    if out.value == MIX_FEE {
        return Step::Done(MixDepth::FeeOutput);
    }
    if rounds == 0 && !is_denominated(out.value) {
        return Step::Done(MixDepth::NotDenominated);
    }
    if !tx.outputs.iter().any(|o| is_denominated(o.value)) {
        return Step::Done(MixDepth::Rounds(rounds));
    }
    Step::Descend(
        tx.inputs
            .iter()
            .map(|i| i.prevout)
            .filter(|prevout| wallet.owns(prevout))
            .collect(),
    )
}

/// Mixing depth of `coin`.
///
/// Each level follows our own inputs of the current transaction in order. A
/// fee-sized ancestor is skipped in favour of the next input; any other
/// answer from an ancestor is final. A level whose inputs are exhausted
/// answers with its own depth as missing.
pub fn mixing_depth(wallet: &dyn Wallet, coin: &OutPoint) -> MixDepth {
    let mut rounds = 0;
    let mut pending = match step(wallet, coin, rounds) {
        Step::Done(depth) => return depth,
        Step::Descend(inputs) => inputs.into_iter(),
    };
    loop {
        let Some(input) = pending.next() else {
            return MixDepth::AncestorMissing(rounds);
        };
        match step(wallet, &input, rounds + 1) {
            Step::Done(MixDepth::FeeOutput) => continue,
            Step::Done(depth) => return depth,
            Step::Descend(inputs) => {
                rounds += 1;
                pending = inputs.into_iter();
            }
        }
    }
}
