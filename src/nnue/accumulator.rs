//! Incrementally updated feature accumulators.
//!
//! One accumulator per subnet per ply, mirroring the search stack: pushed
//! on `do_move`, popped on `undo_move`. A king move invalidates the whole
//! perspective (the feature set is king-bucketed), which is repaired from
//! the per-thread refresh table instead of re-walking move history.

use cozy_chess::{Color, Piece, Square};

use crate::position::{DirtyPiece, Position};
use crate::types::MAX_PLY;

use super::network::{Network, BIG_H, KING_BUCKETS, SMALL_H};
use super::Networks;

/// King-placement bucket of `king` as seen from `perspective`.
#[must_use]
pub fn king_bucket(perspective: Color, king: Square) -> usize {
    let sq = orient(perspective, king);
    let rank = sq as usize / 8;
    let file = sq as usize % 8;
    usize::from(rank >= 4) * 2 + usize::from(file >= 4)
}

#[inline]
fn orient(perspective: Color, sq: Square) -> Square {
    match perspective {
        Color::White => sq,
        Color::Black => sq.flip_rank(),
    }
}

/// Index of the (piece, square) feature from `perspective` with its king
/// in `bucket`.
#[must_use]
pub fn feature_index(
    perspective: Color,
    bucket: usize,
    piece_color: Color,
    piece: Piece,
    sq: Square,
) -> usize {
    let piece_idx = piece as usize * 2 + usize::from(piece_color != perspective);
    (bucket * 12 + piece_idx) * 64 + orient(perspective, sq) as usize
}

/// Dense hidden layer state for one subnet, both perspectives.
#[derive(Clone)]
pub struct Accumulator<const H: usize> {
    pub values: [[i16; H]; 2],
    pub psqt: [i32; 2],
}

impl<const H: usize> Accumulator<H> {
    fn new() -> Self {
        Accumulator {
            values: [[0; H]; 2],
            psqt: [0; 2],
        }
    }

    fn add_feature(&mut self, net: &Network<H>, perspective: Color, feature: usize) {
        let p = perspective as usize;
        let row = &net.ft_weights[feature * H..(feature + 1) * H];
        for (v, w) in self.values[p].iter_mut().zip(row) {
            *v += w;
        }
        self.psqt[p] += net.psqt_weights[feature];
    }

    fn sub_feature(&mut self, net: &Network<H>, perspective: Color, feature: usize) {
        let p = perspective as usize;
        let row = &net.ft_weights[feature * H..(feature + 1) * H];
        for (v, w) in self.values[p].iter_mut().zip(row) {
            *v -= w;
        }
        self.psqt[p] -= net.psqt_weights[feature];
    }

    /// Recompute one perspective from the piece placement.
    fn refresh_perspective(&mut self, net: &Network<H>, pos: &Position, perspective: Color) {
        let p = perspective as usize;
        self.values[p].copy_from_slice(&net.ft_bias);
        self.psqt[p] = 0;
        let bucket = king_bucket(perspective, pos.board().king(perspective));
        for color in Color::ALL {
            for piece in Piece::ALL {
                for sq in pos.board().colored_pieces(color, piece) {
                    self.add_feature(net, perspective, feature_index(perspective, bucket, color, piece, sq));
                }
            }
        }
    }
}

/// Cached accumulator per (perspective, king bucket), used to repair a
/// perspective after a king move by diffing piece bitboards.
struct RefreshEntry<const H: usize> {
    values: [i16; H],
    psqt: i32,
    pieces: [[u64; 6]; 2],
}

impl<const H: usize> RefreshEntry<H> {
    fn new(net: &Network<H>) -> Self {
        let mut values = [0i16; H];
        values.copy_from_slice(&net.ft_bias);
        RefreshEntry {
            values,
            psqt: 0,
            pieces: [[0; 6]; 2],
        }
    }

    fn apply(&mut self, net: &Network<H>, pos: &Position, perspective: Color, bucket: usize) {
        for color in Color::ALL {
            for piece in Piece::ALL {
                let want = pos.board().colored_pieces(color, piece).0;
                let have = self.pieces[color as usize][piece as usize];
                let mut added = want & !have;
                while added != 0 {
                    let sq = Square::index_const(added.trailing_zeros() as usize);
                    let feature = feature_index(perspective, bucket, color, piece, sq);
                    let row = &net.ft_weights[feature * H..(feature + 1) * H];
                    for (v, w) in self.values.iter_mut().zip(row) {
                        *v += w;
                    }
                    self.psqt += net.psqt_weights[feature];
                    added &= added - 1;
                }
                let mut removed = have & !want;
                while removed != 0 {
                    let sq = Square::index_const(removed.trailing_zeros() as usize);
                    let feature = feature_index(perspective, bucket, color, piece, sq);
                    let row = &net.ft_weights[feature * H..(feature + 1) * H];
                    for (v, w) in self.values.iter_mut().zip(row) {
                        *v -= w;
                    }
                    self.psqt -= net.psqt_weights[feature];
                    removed &= removed - 1;
                }
                self.pieces[color as usize][piece as usize] = want;
            }
        }
    }
}

/// Per-thread refresh cache for both subnets.
pub struct RefreshTable {
    big: Vec<RefreshEntry<BIG_H>>,
    small: Vec<RefreshEntry<SMALL_H>>,
}

impl RefreshTable {
    #[must_use]
    pub fn new(networks: &Networks) -> Self {
        RefreshTable {
            big: (0..2 * KING_BUCKETS).map(|_| RefreshEntry::new(&networks.big)).collect(),
            small: (0..2 * KING_BUCKETS).map(|_| RefreshEntry::new(&networks.small)).collect(),
        }
    }

    /// Drop all cached state (network swap or `search_clear`).
    pub fn clear(&mut self, networks: &Networks) {
        *self = RefreshTable::new(networks);
    }
}

/// Stack of accumulators for both subnets, kept in lockstep with the
/// worker's position stack.
pub struct AccumulatorStack {
    big: Vec<Accumulator<BIG_H>>,
    small: Vec<Accumulator<SMALL_H>>,
}

impl AccumulatorStack {
    #[must_use]
    pub fn new() -> Self {
        AccumulatorStack {
            big: Vec::with_capacity(MAX_PLY + 10),
            small: Vec::with_capacity(MAX_PLY + 10),
        }
    }

    /// Recompute from scratch for a new root position.
    pub fn reset(&mut self, pos: &Position, networks: &Networks) {
        self.big.clear();
        self.small.clear();
        let mut big = Accumulator::new();
        let mut small = Accumulator::new();
        for perspective in Color::ALL {
            big.refresh_perspective(&networks.big, pos, perspective);
            small.refresh_perspective(&networks.small, pos, perspective);
        }
        self.big.push(big);
        self.small.push(small);
    }

    /// Apply the deltas of the move just played on `pos`.
    pub fn push(
        &mut self,
        pos: &Position,
        dirty: &DirtyPiece,
        networks: &Networks,
        refresh: &mut RefreshTable,
    ) {
        let big = next_accumulator(
            self.big.last().expect("stack initialized"),
            &networks.big,
            pos,
            dirty,
            &mut refresh.big,
        );
        let small = next_accumulator(
            self.small.last().expect("stack initialized"),
            &networks.small,
            pos,
            dirty,
            &mut refresh.small,
        );
        self.big.push(big);
        self.small.push(small);
    }

    pub fn pop(&mut self) {
        debug_assert!(self.big.len() > 1);
        self.big.pop();
        self.small.pop();
    }

    #[must_use]
    pub fn top_big(&self) -> &Accumulator<BIG_H> {
        self.big.last().expect("stack initialized")
    }

    #[must_use]
    pub fn top_small(&self) -> &Accumulator<SMALL_H> {
        self.small.last().expect("stack initialized")
    }
}

impl Default for AccumulatorStack {
    fn default() -> Self {
        Self::new()
    }
}

fn next_accumulator<const H: usize>(
    prev: &Accumulator<H>,
    net: &Network<H>,
    pos: &Position,
    dirty: &DirtyPiece,
    refresh: &mut [RefreshEntry<H>],
) -> Accumulator<H> {
    let mut acc = prev.clone();
    for perspective in Color::ALL {
        if dirty.moved_king(perspective) {
            // Bucket may have changed; rebuild this perspective from the
            // refresh cache rather than feature deltas.
            let bucket = king_bucket(perspective, pos.board().king(perspective));
            let entry = &mut refresh[perspective as usize * KING_BUCKETS + bucket];
            entry.apply(net, pos, perspective, bucket);
            acc.values[perspective as usize].copy_from_slice(&entry.values);
            acc.psqt[perspective as usize] = entry.psqt;
        } else {
            let bucket = king_bucket(perspective, pos.board().king(perspective));
            for &(color, piece, sq) in &dirty.subs[..dirty.num_subs] {
                acc.sub_feature(net, perspective, feature_index(perspective, bucket, color, piece, sq));
            }
            for &(color, piece, sq) in &dirty.adds[..dirty.num_adds] {
                acc.add_feature(net, perspective, feature_index(perspective, bucket, color, piece, sq));
            }
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrambled_networks() -> Networks {
        let mut networks = Networks::material_baseline();
        // Deterministic nonzero weights so incremental errors are visible.
        let mut state = 0x1357_9bdf_2468_aceu64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for w in &mut networks.big.ft_weights {
            *w = (next() % 61) as i16 - 30;
        }
        for w in &mut networks.small.ft_weights {
            *w = (next() % 61) as i16 - 30;
        }
        for w in &mut networks.big.psqt_weights {
            *w = (next() % 401) as i32 - 200;
        }
        networks
    }

    #[test]
    fn incremental_matches_refresh_over_a_game() {
        let networks = scrambled_networks();
        let mut refresh = RefreshTable::new(&networks);
        let mut pos = Position::new();
        let mut stack = AccumulatorStack::new();
        stack.reset(&pos, &networks);

        // Includes captures, castling (both sides), en passant, promotion.
        let game = [
            "e2e4", "d7d5", "e4d5", "g8f6", "g1f3", "f6d5", "f1c4", "e7e6",
            "e1g1", "f8e7", "d2d4", "e8g8", "c2c4", "d5b4", "a2a3", "b4c6",
            "d4d5", "e6d5", "c4d5", "c6a5", "b2b4", "a5c4", "d5d6", "e7f6",
            "d6c7", "d8e7", "c7b8q",
        ];
        for s in game {
            let mv = cozy_chess::util::parse_uci_move(pos.board(), s).unwrap();
            let dirty = pos.do_move(mv);
            stack.push(&pos, &dirty, &networks, &mut refresh);

            let mut fresh = AccumulatorStack::new();
            fresh.reset(&pos, &networks);
            assert_eq!(stack.top_big().values, fresh.top_big().values, "big diverged after {s}");
            assert_eq!(stack.top_big().psqt, fresh.top_big().psqt, "big psqt diverged after {s}");
            assert_eq!(stack.top_small().values, fresh.top_small().values, "small diverged after {s}");
        }
    }

    #[test]
    fn pop_restores_previous_state() {
        let networks = scrambled_networks();
        let mut refresh = RefreshTable::new(&networks);
        let mut pos = Position::new();
        let mut stack = AccumulatorStack::new();
        stack.reset(&pos, &networks);
        let before = stack.top_big().values;

        let mv = cozy_chess::util::parse_uci_move(pos.board(), "e2e4").unwrap();
        let dirty = pos.do_move(mv);
        stack.push(&pos, &dirty, &networks, &mut refresh);
        stack.pop();
        assert_eq!(stack.top_big().values, before);
    }
}
