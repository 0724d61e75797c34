//! Syzygy-style tablebase probing interface.
//!
//! Search consumes probes through the `Tablebases` trait so the decoding
//! backend stays pluggable. The built-in `NoTablebases` prober reports no
//! coverage and turns every probe into a miss.

use crate::position::Position;
use crate::search::RootMove;
use crate::types::{Depth, Value, VALUE_DRAW, VALUE_TB};

/// Win/draw/loss from the side to move's perspective, with the two
/// cursed outcomes the 50 move rule introduces.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Wdl {
    Loss,
    BlessedLoss,
    Draw,
    CursedWin,
    Win,
}

impl Wdl {
    /// Search value of this outcome at `ply`, cursed outcomes folded to
    /// near-draw scores.
    #[must_use]
    pub fn to_value(self, ply: usize) -> Value {
        match self {
            Wdl::Win => VALUE_TB - ply as Value,
            Wdl::Loss => -VALUE_TB + ply as Value,
            Wdl::CursedWin => VALUE_DRAW + 1,
            Wdl::BlessedLoss => VALUE_DRAW - 1,
            Wdl::Draw => VALUE_DRAW,
        }
    }
}

/// Probe configuration mirrored from the engine options.
#[derive(Clone, Debug)]
pub struct TbConfig {
    pub probe_limit: u32,
    pub probe_depth: Depth,
    pub rule50: bool,
}

impl Default for TbConfig {
    fn default() -> Self {
        TbConfig {
            probe_limit: 7,
            probe_depth: 1,
            rule50: true,
        }
    }
}

/// A tablebase backend. Implementations must be callable from every
/// search thread concurrently.
pub trait Tablebases: Send + Sync {
    /// Largest piece count with any coverage; 0 disables probing.
    fn max_cardinality(&self) -> u32;

    /// WDL probe, valid only when rule-50 is zero and castling is gone.
    /// `None` means the table is missing or the probe failed.
    fn probe_wdl(&self, pos: &Position) -> Option<Wdl>;

    /// Rank the root moves by DTZ (or WDL as a fallback), filling
    /// `tb_rank` and `tb_score`. Returns true when every root move got
    /// ranked, which pins the search to TB-preserving moves.
    fn rank_root_moves(
        &self,
        pos: &Position,
        root_moves: &mut [RootMove],
        config: &TbConfig,
    ) -> bool;
}

/// Backend used when no tablebase path is configured.
pub struct NoTablebases;

impl Tablebases for NoTablebases {
    fn max_cardinality(&self) -> u32 {
        0
    }

    fn probe_wdl(&self, _pos: &Position) -> Option<Wdl> {
        None
    }

    fn rank_root_moves(
        &self,
        _pos: &Position,
        _root_moves: &mut [RootMove],
        _config: &TbConfig,
    ) -> bool {
        false
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Fixed-answer prober for search tests.
    pub struct FixedWdl {
        pub cardinality: u32,
        pub wdl: Wdl,
    }

    impl Tablebases for FixedWdl {
        fn max_cardinality(&self) -> u32 {
            self.cardinality
        }

        fn probe_wdl(&self, pos: &Position) -> Option<Wdl> {
            (pos.piece_count() <= self.cardinality).then_some(self.wdl)
        }

        fn rank_root_moves(
            &self,
            _pos: &Position,
            _root_moves: &mut [RootMove],
            _config: &TbConfig,
        ) -> bool {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wdl_values_are_ordered() {
        let at = |w: Wdl| w.to_value(4);
        assert!(at(Wdl::Win) > at(Wdl::CursedWin));
        assert!(at(Wdl::CursedWin) > at(Wdl::Draw));
        assert!(at(Wdl::Draw) > at(Wdl::BlessedLoss));
        assert!(at(Wdl::BlessedLoss) > at(Wdl::Loss));
    }

    #[test]
    fn deeper_wins_score_lower() {
        assert!(Wdl::Win.to_value(2) > Wdl::Win.to_value(10));
        assert!(Wdl::Loss.to_value(2) < Wdl::Loss.to_value(10));
    }

    #[test]
    fn no_tablebases_never_hits() {
        let tb = NoTablebases;
        assert_eq!(tb.max_cardinality(), 0);
        assert!(tb.probe_wdl(&Position::new()).is_none());
    }
}
