//! Core value types shared across the engine.
//!
//! Scores are plain `i32` centipawn-ish values inside the search; the
//! `Score` sum type is the public projection used by the engine callbacks
//! (`cp N` / `mate N` / tablebase scores).

use cozy_chess::Piece;

/// Search value type. Always within `[-VALUE_INFINITE, VALUE_INFINITE]`.
pub type Value = i32;

/// Depth in plies. Negative depths are quiescence sentinels.
pub type Depth = i32;

/// Maximum search ply.
pub const MAX_PLY: usize = 246;

/// Maximum number of moves in a legal position (with headroom).
pub const MAX_MOVES: usize = 256;

pub const VALUE_ZERO: Value = 0;
pub const VALUE_DRAW: Value = 0;
pub const VALUE_MATE: Value = 32000;
pub const VALUE_INFINITE: Value = 32001;
pub const VALUE_NONE: Value = 32002;

pub const VALUE_MATE_IN_MAX_PLY: Value = VALUE_MATE - MAX_PLY as Value;
pub const VALUE_MATED_IN_MAX_PLY: Value = -VALUE_MATE_IN_MAX_PLY;

pub const VALUE_TB: Value = VALUE_MATE_IN_MAX_PLY - 1;
pub const VALUE_TB_WIN_IN_MAX_PLY: Value = VALUE_TB - MAX_PLY as Value;
pub const VALUE_TB_LOSS_IN_MAX_PLY: Value = -VALUE_TB_WIN_IN_MAX_PLY;

/// Depth sentinel stored in the TT for quiescence entries.
pub const DEPTH_QS: Depth = 0;
/// Depth sentinel for entries that carry only a static eval.
pub const DEPTH_UNSEARCHED: Depth = -2;
/// Smallest depth representable in a TT entry.
pub const DEPTH_ENTRY_OFFSET: Depth = -3;

pub const PAWN_VALUE: Value = 208;
pub const KNIGHT_VALUE: Value = 781;
pub const BISHOP_VALUE: Value = 825;
pub const ROOK_VALUE: Value = 1276;
pub const QUEEN_VALUE: Value = 2538;

/// Mate "from our side" in `ply` plies.
#[must_use]
pub const fn mate_in(ply: i32) -> Value {
    VALUE_MATE - ply
}

/// Mated in `ply` plies.
#[must_use]
pub const fn mated_in(ply: i32) -> Value {
    -VALUE_MATE + ply
}

#[must_use]
pub fn is_win(value: Value) -> bool {
    value >= VALUE_TB_WIN_IN_MAX_PLY
}

#[must_use]
pub fn is_loss(value: Value) -> bool {
    value <= VALUE_TB_LOSS_IN_MAX_PLY
}

#[must_use]
pub fn is_decisive(value: Value) -> bool {
    is_win(value) || is_loss(value)
}

/// Material value of a piece for SEE and pruning margins.
#[must_use]
pub fn piece_value(piece: Piece) -> Value {
    match piece {
        Piece::Pawn => PAWN_VALUE,
        Piece::Knight => KNIGHT_VALUE,
        Piece::Bishop => BISHOP_VALUE,
        Piece::Rook => ROOK_VALUE,
        Piece::Queen => QUEEN_VALUE,
        Piece::King => 0,
    }
}

/// Entry bound stored in the transposition table.
///
/// `Exact` is `Lower | Upper`; the discriminants are bit flags so a bound
/// check is a single mask test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Bound {
    None = 0,
    Upper = 1,
    Lower = 2,
    Exact = 3,
}

impl Bound {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Bound::None,
            1 => Bound::Upper,
            2 => Bound::Lower,
            _ => Bound::Exact,
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// True if this bound constrains the value from below (fail-high side).
    #[must_use]
    pub fn admits_lower(self) -> bool {
        self.bits() & Bound::Lower.bits() != 0
    }

    /// True if this bound constrains the value from above (fail-low side).
    #[must_use]
    pub fn admits_upper(self) -> bool {
        self.bits() & Bound::Upper.bits() != 0
    }
}

/// Public score projection emitted through the engine callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Score {
    /// Centipawn score from the side to move's point of view.
    Cp(i32),
    /// Mate in N plies (negative: we get mated).
    Mate(i32),
    /// Tablebase score: forced conversion in `plies`.
    Tablebase { plies: i32, win: bool },
}

impl Score {
    /// Project an internal search value at the root into a `Score`.
    #[must_use]
    pub fn from_value(v: Value) -> Self {
        debug_assert!(v.abs() < VALUE_INFINITE);
        if v.abs() < VALUE_TB_WIN_IN_MAX_PLY {
            // Internal values are already on a centipawn-like scale.
            Score::Cp(v)
        } else if v.abs() <= VALUE_TB {
            Score::Tablebase {
                plies: VALUE_TB - v.abs(),
                win: v > 0,
            }
        } else {
            Score::Mate(if v > 0 { VALUE_MATE - v } else { -VALUE_MATE - v })
        }
    }

    /// Format per the UCI `score` field: `cp N` or `mate N`.
    #[must_use]
    pub fn format_uci(self) -> String {
        match self {
            Score::Cp(cp) => format!("cp {cp}"),
            Score::Mate(plies) => {
                // Full moves, rounded up, negative when we are getting mated.
                let moves = if plies > 0 { (plies + 1) / 2 } else { plies / 2 };
                format!("mate {moves}")
            }
            Score::Tablebase { plies, win } => {
                let v = if win { VALUE_TB - plies } else { -VALUE_TB + plies };
                format!("cp {v}")
            }
        }
    }
}

/// Win/draw/loss probabilities in per-mille, from white's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WdlStats {
    pub win: i32,
    pub draw: i32,
    pub loss: i32,
}

/// Coefficients of the material-dependent logistic win-rate model.
const WDL_AS: [f64; 4] = [-13.50, 40.67, -36.66, 270.86];
const WDL_BS: [f64; 4] = [-7.25, 64.14, -91.02, 128.53];

/// Single-side win probability per mille for `v` centipawns and a given
/// total material count, via `1000 / (1 + exp((a - v) / b))`.
fn win_rate(v: Value, material: i32) -> i32 {
    // The model is fitted for the middlegame material range.
    let m = f64::from(material.clamp(17, 78)) / 58.0;
    let a = ((WDL_AS[0] * m + WDL_AS[1]) * m + WDL_AS[2]) * m + WDL_AS[3];
    let b = ((WDL_BS[0] * m + WDL_BS[1]) * m + WDL_BS[2]) * m + WDL_BS[3];
    let v = f64::from(v).clamp(-4000.0, 4000.0);
    (0.5 + 1000.0 / (1.0 + ((a - v) / b).exp())) as i32
}

/// Map a centipawn score and a material count to WDL per-mille stats.
#[must_use]
pub fn wdl_model(v: Value, material: i32) -> WdlStats {
    let win = win_rate(v, material);
    let loss = win_rate(-v, material);
    WdlStats {
        win,
        draw: 1000 - win - loss,
        loss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mate_helpers_are_symmetric() {
        assert_eq!(mate_in(3), VALUE_MATE - 3);
        assert_eq!(mated_in(3), -VALUE_MATE + 3);
        assert!(is_win(mate_in(10)));
        assert!(is_loss(mated_in(10)));
        assert!(!is_decisive(150));
    }

    #[test]
    fn score_projection_centipawns() {
        assert_eq!(Score::from_value(42), Score::Cp(42));
        assert_eq!(Score::from_value(42).format_uci(), "cp 42");
    }

    #[test]
    fn score_projection_mate() {
        let v = mate_in(3);
        assert_eq!(Score::from_value(v), Score::Mate(3));
        assert_eq!(Score::from_value(v).format_uci(), "mate 2");
        let v = mated_in(4);
        assert_eq!(Score::from_value(v), Score::Mate(-4));
        assert_eq!(Score::from_value(v).format_uci(), "mate -2");
    }

    #[test]
    fn bound_flags() {
        assert!(Bound::Exact.admits_lower());
        assert!(Bound::Exact.admits_upper());
        assert!(Bound::Lower.admits_lower());
        assert!(!Bound::Lower.admits_upper());
        assert_eq!(Bound::from_bits(Bound::Upper.bits()), Bound::Upper);
    }

    #[test]
    fn wdl_probabilities_sum_to_one() {
        for v in [-500, -100, 0, 100, 500] {
            let wdl = wdl_model(v, 60);
            assert_eq!(wdl.win + wdl.draw + wdl.loss, 1000);
        }
        // A big positive score should be mostly winning.
        assert!(wdl_model(800, 60).win > 800);
    }
}
