//! Search tuning parameters.
//!
//! Every constant here is a free parameter found by self-play tuning, not
//! a derived quantity. Grouped by the search step that consumes it.

use once_cell::sync::Lazy;

use crate::types::{Depth, Value, MAX_MOVES};

// Aspiration windows.
pub const ASPIRATION_MIN_DEPTH: Depth = 4;
pub const ASPIRATION_DELTA_BASE: Value = 5;
pub const ASPIRATION_DELTA_DIV: i64 = 13_797;

// Razoring.
pub const RAZOR_BASE: Value = 462;
pub const RAZOR_DEPTH_MULT: Value = 297;

// Child-node futility.
pub const FUTILITY_MAX_DEPTH: Depth = 14;
pub const FUTILITY_MULT: Value = 91;
pub const FUTILITY_IMPROVING: Value = 58;
pub const FUTILITY_WORSENING: Value = 17;
pub const FUTILITY_STAT_DIV: i32 = 260;

// Null move.
pub const NULL_MOVE_EVAL_MARGIN: Value = 23;
pub const NULL_MOVE_BASE_REDUCTION: Depth = 4;
pub const NULL_MOVE_EVAL_DIV: Value = 202;
pub const NULL_MOVE_VERIFY_DEPTH: Depth = 16;

// Internal iterative reduction.
pub const IIR_MIN_DEPTH: Depth = 4;

// ProbCut.
pub const PROBCUT_MARGIN: Value = 174;
pub const PROBCUT_IMPROVING: Value = 56;
pub const PROBCUT_MIN_DEPTH: Depth = 3;
pub const PROBCUT_REDUCTION: Depth = 4;

// Shallow-depth pruning inside the moves loop.
pub const LMP_BASE: i32 = 3;
pub const CAPTURE_FUTILITY_BASE: Value = 242;
pub const CAPTURE_FUTILITY_MULT: Value = 230;
pub const CAPTURE_HIST_DIV: i32 = 7;
pub const CAPTURE_SEE_MULT: Value = 180;
pub const QUIET_CONT_HIST_BASE: i32 = -4107;
pub const QUIET_FUTILITY_BASE: Value = 78;
pub const QUIET_FUTILITY_MULT: Value = 109;
pub const QUIET_SEE_MULT: Value = 24;

// Singular extensions.
pub const SINGULAR_MIN_DEPTH: Depth = 6;
pub const SINGULAR_MARGIN_MULT: Value = 1;
pub const SINGULAR_DOUBLE_MARGIN: Value = 14;
pub const SINGULAR_TRIPLE_MARGIN: Value = 111;

// Late-move reductions; `r` is kept in 1024ths of a ply.
pub const LMR_BASE: i32 = 1135;
pub const LMR_NON_IMPROVING: i32 = 1404;
pub const LMR_DELTA_MULT: i32 = 794;
pub const LMR_TT_PV: i32 = 1024;
pub const LMR_CUT_NODE: i32 = 2 * 1024;
pub const LMR_TT_CAPTURE: i32 = 1024;
pub const LMR_CUTOFF_CNT: i32 = 1024;
pub const LMR_STAT_DIV: i32 = 10;
pub const LMR_DEEPER_BASE: Value = 43;
pub const LMR_DEEPER_DEPTH_MULT: Value = 2;

// Quiescence.
pub const QS_FUTILITY_MARGIN: Value = 280;

// History bonuses and maluses by depth.
pub const STAT_BONUS_MULT: i32 = 190;
pub const STAT_BONUS_SUB: i32 = 108;
pub const STAT_BONUS_MAX: i32 = 1596;
pub const STAT_MALUS_MULT: i32 = 736;
pub const STAT_MALUS_SUB: i32 = 268;
pub const STAT_MALUS_MAX: i32 = 2044;

// Correction history blend weights, applied to table values before the
// final `/ 131072` scale.
pub const CORR_PAWN_WEIGHT: i32 = 7685;
pub const CORR_MINOR_WEIGHT: i32 = 6495;
pub const CORR_NON_PAWN_WEIGHT: i32 = 7247;
pub const CORR_CONT_WEIGHT: i32 = 7077;

// Time management scale factors.
pub const FALLING_EVAL_CLAMP: (f64, f64) = (0.5786, 1.6752);
pub const INSTABILITY_BASE: f64 = 0.9929;
pub const INSTABILITY_MULT: f64 = 1.8519;

/// Skill handicap: Elo endpoints mapped onto the internal 0..=20 level.
pub const SKILL_LOWEST_ELO: i32 = 1320;
pub const SKILL_HIGHEST_ELO: i32 = 3190;

/// Log-scaled reduction table indexed by depth or move number, shared by
/// every worker.
pub static REDUCTIONS: Lazy<Vec<i32>> = Lazy::new(|| reductions_table(MAX_MOVES));

/// Log-scaled reduction table indexed by depth or move number.
#[must_use]
pub fn reductions_table(size: usize) -> Vec<i32> {
    let mut table = vec![0; size];
    for (i, slot) in table.iter_mut().enumerate().skip(1) {
        *slot = (2809.0 / 128.0 * (i as f64).ln()) as i32;
    }
    table
}

/// Fail-high bonus for a move searched at `depth`.
#[must_use]
pub fn stat_bonus(depth: Depth) -> i32 {
    (STAT_BONUS_MULT * depth - STAT_BONUS_SUB).clamp(0, STAT_BONUS_MAX)
}

/// Penalty for moves that were tried before the fail-high.
#[must_use]
pub fn stat_malus(depth: Depth) -> i32 {
    (STAT_MALUS_MULT * depth - STAT_MALUS_SUB).clamp(0, STAT_MALUS_MAX)
}

/// Margin under which razoring drops straight into quiescence.
#[must_use]
pub fn razor_margin(depth: Depth) -> Value {
    RAZOR_BASE + RAZOR_DEPTH_MULT * depth * depth
}

/// Futility margin for the child-node eval cutoff.
#[must_use]
pub fn futility_margin(depth: Depth, improving: bool, worsening: bool) -> Value {
    FUTILITY_MULT * depth - Value::from(improving) * FUTILITY_IMPROVING * depth
        - Value::from(worsening) * FUTILITY_WORSENING
}

/// Movecount ceiling before the picker stops yielding quiets.
#[must_use]
pub fn lmp_threshold(depth: Depth, improving: bool) -> i32 {
    (LMP_BASE + depth * depth) / (2 - i32::from(improving))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reductions_grow_with_index() {
        let table = reductions_table(64);
        assert_eq!(table[1], 0);
        for i in 2..64 {
            assert!(table[i] >= table[i - 1]);
        }
        assert!(table[63] > 80);
    }

    #[test]
    fn stat_bonus_saturates() {
        assert_eq!(stat_bonus(0), 0);
        assert!(stat_bonus(5) > stat_bonus(2));
        assert_eq!(stat_bonus(100), STAT_BONUS_MAX);
    }

    #[test]
    fn lmp_is_more_permissive_when_improving() {
        assert!(lmp_threshold(4, true) > lmp_threshold(4, false));
    }
}
