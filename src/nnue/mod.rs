//! Efficiently updatable neural network evaluation.
//!
//! Two subnets share one architecture at different widths: the big net
//! scores balanced positions, the small net takes over once the material
//! count says the game is already decided. Both read the same king-bucketed
//! piece features through incrementally maintained accumulators.

mod accumulator;
mod network;

pub use accumulator::{feature_index, king_bucket, Accumulator, AccumulatorStack, RefreshTable};
pub use network::{Network, NetworkError, BIG_H, FC_OUT, KING_BUCKETS, QA, SMALL_H};

use std::path::Path;

use crate::position::Position;
use crate::types::{Value, VALUE_TB_LOSS_IN_MAX_PLY, VALUE_TB_WIN_IN_MAX_PLY};

/// Positions with a material imbalance beyond this (in internal units) are
/// evaluated by the small net.
const SMALL_NET_THRESHOLD: Value = 962;

/// The pair of evaluation networks used by every search thread.
pub struct Networks {
    pub big: Network<BIG_H>,
    pub small: Network<SMALL_H>,
}

impl Networks {
    /// Built-in fallback when no network file is configured: the PSQT head
    /// carries plain material, the layer stack is silent.
    #[must_use]
    pub fn material_baseline() -> Self {
        Networks {
            big: Network::material_baseline(),
            small: Network::material_baseline(),
        }
    }

    pub fn load_big<P: AsRef<Path>>(&mut self, path: P) -> Result<(), NetworkError> {
        self.big = Network::load(path)?;
        Ok(())
    }

    pub fn load_small<P: AsRef<Path>>(&mut self, path: P) -> Result<(), NetworkError> {
        self.small = Network::load(path)?;
        Ok(())
    }

    pub fn save_big<P: AsRef<Path>>(&self, path: P) -> Result<(), NetworkError> {
        self.big.save(path)
    }

    pub fn save_small<P: AsRef<Path>>(&self, path: P) -> Result<(), NetworkError> {
        self.small.save(path)
    }
}

impl Default for Networks {
    fn default() -> Self {
        Self::material_baseline()
    }
}

/// Static evaluation from the side to move's point of view.
///
/// Never called in check; check positions are resolved by search. The
/// result is strictly inside the tablebase range so a static eval can
/// never masquerade as a proven outcome.
#[must_use]
pub fn evaluate(
    networks: &Networks,
    pos: &Position,
    stack: &AccumulatorStack,
    optimism: Value,
) -> Value {
    debug_assert!(!pos.in_check());

    let us = pos.side_to_move() as usize;
    let them = us ^ 1;
    let small_net = pos.simple_eval().abs() > SMALL_NET_THRESHOLD;

    let (psqt, positional) = if small_net {
        let acc = stack.top_small();
        (
            (acc.psqt[us] - acc.psqt[them]) / 2,
            networks.small.forward(&acc.values[us], &acc.values[them]),
        )
    } else {
        let acc = stack.top_big();
        (
            (acc.psqt[us] - acc.psqt[them]) / 2,
            networks.big.forward(&acc.values[us], &acc.values[them]),
        )
    };

    let material = pos.material_count();
    let mut v = (psqt + positional) * (580 + material) / 730;
    v += optimism * (128 + material) / 512;

    // Drift toward zero as the 50 move counter runs down.
    v = v * (200 - pos.rule50_count() as i32) / 200;

    v.clamp(VALUE_TB_LOSS_IN_MAX_PLY + 1, VALUE_TB_WIN_IN_MAX_PLY - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::piece_value;
    use cozy_chess::Piece;

    fn eval_of(fen: &str) -> Value {
        let networks = Networks::material_baseline();
        let pos = Position::from_fen(fen, false).unwrap();
        let mut stack = AccumulatorStack::new();
        stack.reset(&pos, &networks);
        evaluate(&networks, &pos, &stack, 0)
    }

    #[test]
    fn startpos_is_balanced() {
        assert_eq!(eval_of("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"), 0);
    }

    #[test]
    fn extra_rook_scores_positive_for_side_to_move() {
        let v = eval_of("4k3/8/8/8/8/8/8/R3K3 w - - 0 1");
        assert!(v > piece_value(Piece::Rook) / 2, "got {v}");
    }

    #[test]
    fn evaluation_is_symmetric_in_side_to_move() {
        let white = eval_of("4k3/8/8/8/8/8/8/R3K3 w - - 0 1");
        let black = eval_of("4k3/8/8/8/8/8/8/R3K3 b - - 0 1");
        assert_eq!(white, -black);
    }

    #[test]
    fn rule50_damping_shrinks_the_score() {
        let fresh = eval_of("4k3/8/8/8/8/8/8/R3K3 w - - 0 1");
        let stale = eval_of("4k3/8/8/8/8/8/8/R3K3 w - - 80 90");
        assert!(stale.abs() < fresh.abs());
    }

    #[test]
    fn optimism_nudges_the_score() {
        let networks = Networks::material_baseline();
        let pos = Position::new();
        let mut stack = AccumulatorStack::new();
        stack.reset(&pos, &networks);
        let neutral = evaluate(&networks, &pos, &stack, 0);
        let hopeful = evaluate(&networks, &pos, &stack, 200);
        assert!(hopeful > neutral);
    }

    #[test]
    fn result_stays_inside_tablebase_range() {
        // Nine queens up; the clamp has to hold.
        let v = eval_of("QQQQQQQQ/8/1k6/8/8/1K6/8/Q7 w - - 0 1");
        assert!(v < VALUE_TB_WIN_IN_MAX_PLY);
    }
}
