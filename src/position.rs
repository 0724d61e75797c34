//! Position wrapper around the `cozy_chess` board.
//!
//! The board crate is copy-make; this wrapper presents the make/unmake
//! interface the search wants, keeps the game history needed for repetition
//! and rule-50 detection, derives the material keys used by the correction
//! histories, and implements static exchange evaluation.

use cozy_chess::{
    get_bishop_moves, get_king_moves, get_knight_moves, get_pawn_attacks, get_rook_moves, util,
    BitBoard, Board, Color, Move, Piece, Rank, Square,
};
use thiserror::Error;

use crate::types::{piece_value, Value};

/// Errors surfaced from position setup. Search itself never fails.
#[derive(Debug, Error)]
pub enum PositionError {
    #[error("invalid FEN '{fen}': {reason}")]
    InvalidFen { fen: String, reason: String },
    #[error("illegal or unparsable move '{0}'")]
    IllegalMove(String),
}

/// Piece deltas produced by one move, consumed by the NNUE accumulator.
///
/// At most two pieces leave the board (capture, or king+rook when castling)
/// and at most two appear (king+rook when castling).
#[derive(Clone, Copy, Debug)]
pub struct DirtyPiece {
    pub adds: [(Color, Piece, Square); 2],
    pub num_adds: usize,
    pub subs: [(Color, Piece, Square); 2],
    pub num_subs: usize,
}

impl Default for DirtyPiece {
    fn default() -> Self {
        // Entries past `num_adds`/`num_subs` are never read; fill with any value.
        let empty = (Color::White, Piece::Pawn, Square::A1);
        DirtyPiece {
            adds: [empty; 2],
            num_adds: 0,
            subs: [empty; 2],
            num_subs: 0,
        }
    }
}

impl DirtyPiece {
    fn add(&mut self, color: Color, piece: Piece, sq: Square) {
        self.adds[self.num_adds] = (color, piece, sq);
        self.num_adds += 1;
    }

    fn sub(&mut self, color: Color, piece: Piece, sq: Square) {
        self.subs[self.num_subs] = (color, piece, sq);
        self.num_subs += 1;
    }

    /// True if either king changed squares.
    #[must_use]
    pub fn moved_king(&self, color: Color) -> bool {
        self.subs[..self.num_subs]
            .iter()
            .any(|&(c, p, _)| c == color && p == Piece::King)
    }
}

struct State {
    board: Board,
    /// Move that produced this state; `None` for the root and null moves.
    mv: Option<Move>,
    moved: Option<Piece>,
    captured: Option<Piece>,
}

/// A chess position plus the history needed to unmake moves and detect
/// repetitions. Owned by exactly one worker thread during search.
pub struct Position {
    stack: Vec<State>,
    chess960: bool,
}

impl Clone for Position {
    fn clone(&self) -> Self {
        Position {
            stack: self
                .stack
                .iter()
                .map(|s| State {
                    board: s.board.clone(),
                    mv: s.mv,
                    moved: s.moved,
                    captured: s.captured,
                })
                .collect(),
            chess960: self.chess960,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new()
    }
}

impl Position {
    /// Standard starting position.
    #[must_use]
    pub fn new() -> Self {
        Position {
            stack: vec![State {
                board: Board::default(),
                mv: None,
                moved: None,
                captured: None,
            }],
            chess960: false,
        }
    }

    /// Parse a FEN. `chess960` selects Shredder-FEN castling interpretation.
    pub fn from_fen(fen: &str, chess960: bool) -> Result<Self, PositionError> {
        let board = Board::from_fen(fen, chess960).map_err(|e| PositionError::InvalidFen {
            fen: fen.to_string(),
            reason: format!("{e:?}"),
        })?;
        Ok(Position {
            stack: vec![State {
                board,
                mv: None,
                moved: None,
                captured: None,
            }],
            chess960,
        })
    }

    #[inline]
    #[must_use]
    pub fn board(&self) -> &Board {
        &self.stack.last().expect("stack never empty").board
    }

    #[must_use]
    pub fn chess960(&self) -> bool {
        self.chess960
    }

    #[must_use]
    pub fn fen(&self) -> String {
        format!("{}", self.board())
    }

    #[inline]
    #[must_use]
    pub fn side_to_move(&self) -> Color {
        self.board().side_to_move()
    }

    /// Full Zobrist key of the current position.
    #[inline]
    #[must_use]
    pub fn key(&self) -> u64 {
        self.board().hash()
    }

    #[inline]
    #[must_use]
    pub fn rule50_count(&self) -> u32 {
        u32::from(self.board().halfmove_clock())
    }

    /// Plies since the game root this position was set up from.
    #[must_use]
    pub fn game_ply(&self) -> u32 {
        self.stack.len() as u32 - 1
    }

    #[inline]
    #[must_use]
    pub fn checkers(&self) -> BitBoard {
        self.board().checkers()
    }

    #[inline]
    #[must_use]
    pub fn in_check(&self) -> bool {
        !self.board().checkers().is_empty()
    }

    #[must_use]
    pub fn piece_on(&self, sq: Square) -> Option<Piece> {
        self.board().piece_on(sq)
    }

    #[must_use]
    pub fn piece_count(&self) -> u32 {
        self.board().occupied().len()
    }

    /// True if either side may still castle (relevant for tablebase probes).
    #[must_use]
    pub fn has_castling_rights(&self) -> bool {
        Color::ALL.iter().any(|&c| {
            let rights = self.board().castle_rights(c);
            rights.short.is_some() || rights.long.is_some()
        })
    }

    #[must_use]
    pub fn has_non_pawn_material(&self, color: Color) -> bool {
        let board = self.board();
        let side = board.colors(color);
        !(side & !(board.pieces(Piece::Pawn) | board.pieces(Piece::King))).is_empty()
    }

    /// Material difference from the side to move's point of view, on the
    /// internal piece-value scale. Used to pick the small NNUE subnet.
    #[must_use]
    pub fn simple_eval(&self) -> Value {
        let board = self.board();
        let us = board.side_to_move();
        let mut v = 0;
        for piece in [Piece::Pawn, Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen] {
            let diff = board.colored_pieces(us, piece).len() as i32
                - board.colored_pieces(!us, piece).len() as i32;
            v += diff * piece_value(piece);
        }
        v
    }

    /// Total material in pawn units, the input of the WDL model.
    #[must_use]
    pub fn material_count(&self) -> i32 {
        let board = self.board();
        let count = |p: Piece| board.pieces(p).len() as i32;
        count(Piece::Pawn)
            + 3 * count(Piece::Knight)
            + 3 * count(Piece::Bishop)
            + 5 * count(Piece::Rook)
            + 9 * count(Piece::Queen)
    }

    // ------------------------------------------------------------------
    // Material keys for the correction histories.
    // Derived by mixing piece bitboards; cheap enough to recompute at the
    // single point per node where the correction tables are consulted.
    // ------------------------------------------------------------------

    #[must_use]
    pub fn pawn_key(&self) -> u64 {
        let board = self.board();
        let w = board.colored_pieces(Color::White, Piece::Pawn).0;
        let b = board.colored_pieces(Color::Black, Piece::Pawn).0;
        splitmix64(splitmix64(w ^ 0x9a3c_12f0_77ab_31cd) ^ b)
    }

    #[must_use]
    pub fn minor_piece_key(&self) -> u64 {
        let board = self.board();
        let minors = board.pieces(Piece::Knight) | board.pieces(Piece::Bishop) | board.pieces(Piece::King);
        let w = (minors & board.colors(Color::White)).0;
        let b = (minors & board.colors(Color::Black)).0;
        splitmix64(splitmix64(w ^ 0x51ab_de09_44d1_9b60) ^ b)
    }

    #[must_use]
    pub fn non_pawn_key(&self, color: Color) -> u64 {
        let board = self.board();
        let mut h = 0xc0ff_ee11_u64 ^ (color as u64) << 1;
        for piece in [Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen, Piece::King] {
            h = splitmix64(h ^ board.colored_pieces(color, piece).0);
        }
        h
    }

    // ------------------------------------------------------------------
    // Move properties
    // ------------------------------------------------------------------

    /// Castling in the underlying board is encoded king-onto-own-rook.
    #[must_use]
    pub fn is_castling(&self, mv: Move) -> bool {
        self.board().color_on(mv.to) == Some(self.side_to_move())
            && self.board().piece_on(mv.from) == Some(Piece::King)
    }

    #[must_use]
    pub fn is_en_passant(&self, mv: Move) -> bool {
        self.board().piece_on(mv.from) == Some(Piece::Pawn)
            && mv.from.file() != mv.to.file()
            && self.board().piece_on(mv.to).is_none()
    }

    /// Capture or queen promotion; what quiescence and probcut iterate.
    #[must_use]
    pub fn is_capture_stage(&self, mv: Move) -> bool {
        self.is_capture(mv) || mv.promotion == Some(Piece::Queen)
    }

    #[must_use]
    pub fn is_capture(&self, mv: Move) -> bool {
        self.board().color_on(mv.to) == Some(!self.side_to_move()) || self.is_en_passant(mv)
    }

    #[must_use]
    pub fn moved_piece(&self, mv: Move) -> Piece {
        self.board().piece_on(mv.from).expect("move origin must be occupied")
    }

    /// Piece captured by `mv`, if any (the pawn for en passant).
    #[must_use]
    pub fn captured_piece(&self, mv: Move) -> Option<Piece> {
        if self.is_en_passant(mv) {
            Some(Piece::Pawn)
        } else if self.is_castling(mv) {
            None
        } else {
            self.board().piece_on(mv.to)
        }
    }

    /// Value of the piece captured by `mv` (zero for quiet moves).
    #[must_use]
    pub fn capture_value(&self, mv: Move) -> Value {
        self.captured_piece(mv).map_or(0, piece_value)
    }

    #[must_use]
    pub fn is_legal(&self, mv: Move) -> bool {
        self.board().is_legal(mv)
    }

    /// Does `mv` give check? Resolved by playing the move on a scratch copy.
    #[must_use]
    pub fn gives_check(&self, mv: Move) -> bool {
        let mut board = self.board().clone();
        board.play_unchecked(mv);
        !board.checkers().is_empty()
    }

    // ------------------------------------------------------------------
    // Move generation
    // ------------------------------------------------------------------

    #[must_use]
    pub fn legal_moves(&self) -> Vec<Move> {
        let mut moves = Vec::with_capacity(48);
        self.board().generate_moves(|ml| {
            moves.extend(ml);
            false
        });
        moves
    }

    /// Captures and queen promotions only.
    #[must_use]
    pub fn capture_stage_moves(&self) -> Vec<Move> {
        let mut moves = Vec::with_capacity(16);
        self.board().generate_moves(|ml| {
            for mv in ml {
                if self.is_capture_stage(mv) {
                    moves.push(mv);
                }
            }
            false
        });
        moves
    }

    #[must_use]
    pub fn has_legal_moves(&self) -> bool {
        self.board().generate_moves(|_| true)
    }

    // ------------------------------------------------------------------
    // Make / unmake
    // ------------------------------------------------------------------

    /// Play a legal move, returning the piece deltas for the evaluator.
    pub fn do_move(&mut self, mv: Move) -> DirtyPiece {
        let us = self.side_to_move();
        let moved = self.moved_piece(mv);
        let captured = self.captured_piece(mv);

        let mut dirty = DirtyPiece::default();
        if self.is_castling(mv) {
            let back = if us == Color::White { Rank::First } else { Rank::Eighth };
            let short = mv.to.file() > mv.from.file();
            let (king_to, rook_to) = if short {
                (Square::new(cozy_chess::File::G, back), Square::new(cozy_chess::File::F, back))
            } else {
                (Square::new(cozy_chess::File::C, back), Square::new(cozy_chess::File::D, back))
            };
            dirty.sub(us, Piece::King, mv.from);
            dirty.sub(us, Piece::Rook, mv.to);
            dirty.add(us, Piece::King, king_to);
            dirty.add(us, Piece::Rook, rook_to);
        } else {
            dirty.sub(us, moved, mv.from);
            if self.is_en_passant(mv) {
                dirty.sub(!us, Piece::Pawn, Square::new(mv.to.file(), mv.from.rank()));
            } else if let Some(victim) = captured {
                dirty.sub(!us, victim, mv.to);
            }
            dirty.add(us, mv.promotion.unwrap_or(moved), mv.to);
        }

        let mut board = self.board().clone();
        board.play_unchecked(mv);
        self.stack.push(State {
            board,
            mv: Some(mv),
            moved: Some(moved),
            captured,
        });
        dirty
    }

    pub fn undo_move(&mut self) {
        debug_assert!(self.stack.len() > 1);
        self.stack.pop();
    }

    /// Pass the turn. Returns `false` (and does nothing) when in check.
    pub fn do_null_move(&mut self) -> bool {
        match self.board().null_move() {
            Some(board) => {
                self.stack.push(State {
                    board,
                    mv: None,
                    moved: None,
                    captured: None,
                });
                true
            }
            None => false,
        }
    }

    pub fn undo_null_move(&mut self) {
        debug_assert!(self.stack.len() > 1);
        debug_assert!(self.stack.last().is_some_and(|s| s.mv.is_none()));
        self.stack.pop();
    }

    /// Parse a UCI move string against the current position and play it.
    pub fn play_uci(&mut self, s: &str) -> Result<(), PositionError> {
        let mv = util::parse_uci_move(self.board(), s)
            .map_err(|_| PositionError::IllegalMove(s.to_string()))?;
        if !self.is_legal(mv) {
            return Err(PositionError::IllegalMove(s.to_string()));
        }
        self.do_move(mv);
        Ok(())
    }

    /// Format a move as standard UCI (handles the castling encoding).
    #[must_use]
    pub fn move_to_uci(&self, mv: Move) -> String {
        if self.chess960 {
            format!("{mv}")
        } else {
            format!("{}", util::display_uci_move(self.board(), mv))
        }
    }

    // ------------------------------------------------------------------
    // Draw detection
    // ------------------------------------------------------------------

    /// Draw by repetition or the 50-move rule. `ply` is the distance from
    /// the search root; repetitions inside the search tree count singly.
    #[must_use]
    pub fn is_draw(&self, ply: usize) -> bool {
        if self.rule50_count() >= 100 && (!self.in_check() || self.has_legal_moves()) {
            return true;
        }
        self.is_repetition(ply)
    }

    /// Twofold repetition within the search tree, threefold across the game.
    #[must_use]
    pub fn is_repetition(&self, ply: usize) -> bool {
        let n = self.stack.len();
        let current = self.board();
        let horizon = (self.rule50_count() as usize).min(n - 1);
        let mut reps = 0;
        let mut d = 2;
        while d <= horizon {
            if self.stack[n - 1 - d].board.same_position(current) {
                if d < ply {
                    return true;
                }
                reps += 1;
                if reps >= 2 {
                    return true;
                }
            }
            d += 2;
        }
        false
    }

    // ------------------------------------------------------------------
    // Static exchange evaluation
    // ------------------------------------------------------------------

    /// True if the exchange started by `mv` nets at least `threshold`.
    /// Swap algorithm over the occupancy bitboards; promotions and en
    /// passant are approximated by their immediate material effect.
    #[must_use]
    pub fn see_ge(&self, mv: Move, threshold: Value) -> bool {
        if self.is_castling(mv) {
            return threshold <= 0;
        }
        let board = self.board();

        let mut balance = self.capture_value(mv) - threshold;
        if balance < 0 {
            return false;
        }
        let next_victim = mv.promotion.unwrap_or_else(|| self.moved_piece(mv));
        balance -= piece_value(next_victim);
        if balance >= 0 {
            return true;
        }

        let mut occupied = board.occupied() ^ mv.from.bitboard();
        occupied |= mv.to.bitboard();
        if self.is_en_passant(mv) {
            occupied ^= Square::new(mv.to.file(), mv.from.rank()).bitboard();
        }

        let diag = board.pieces(Piece::Bishop) | board.pieces(Piece::Queen);
        let line = board.pieces(Piece::Rook) | board.pieces(Piece::Queen);

        let mut stm = !self.side_to_move();
        let mut attackers = self.attackers_to(mv.to, occupied);
        let mut result = true;

        loop {
            attackers &= occupied;
            let our_attackers = attackers & board.colors(stm);
            if our_attackers.is_empty() {
                break;
            }
            // Least valuable attacker recaptures next.
            let mut picked = None;
            for piece in [Piece::Pawn, Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen, Piece::King] {
                let candidates = our_attackers & board.pieces(piece);
                if let Some(sq) = candidates.next_square() {
                    picked = Some((piece, sq));
                    break;
                }
            }
            let (piece, from_sq) = picked.expect("non-empty attacker set");

            result = !result;
            balance = -balance - 1 - piece_value(piece);
            if balance >= 0 {
                // The king cannot recapture into remaining enemy attackers.
                if piece == Piece::King && !(attackers & board.colors(!stm)).is_empty() {
                    result = !result;
                }
                break;
            }

            occupied ^= from_sq.bitboard();
            // Sliders behind the vacated square join the exchange.
            if matches!(piece, Piece::Pawn | Piece::Bishop | Piece::Queen) {
                attackers |= get_bishop_moves(mv.to, occupied) & diag;
            }
            if matches!(piece, Piece::Rook | Piece::Queen) {
                attackers |= get_rook_moves(mv.to, occupied) & line;
            }
            stm = !stm;
        }
        result
    }

    fn attackers_to(&self, sq: Square, occupied: BitBoard) -> BitBoard {
        let board = self.board();
        (get_pawn_attacks(sq, Color::Black) & board.colored_pieces(Color::White, Piece::Pawn))
            | (get_pawn_attacks(sq, Color::White) & board.colored_pieces(Color::Black, Piece::Pawn))
            | (get_knight_moves(sq) & board.pieces(Piece::Knight))
            | (get_king_moves(sq) & board.pieces(Piece::King))
            | (get_bishop_moves(sq, occupied)
                & (board.pieces(Piece::Bishop) | board.pieces(Piece::Queen)))
            | (get_rook_moves(sq, occupied)
                & (board.pieces(Piece::Rook) | board.pieces(Piece::Queen)))
    }
}

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn do_undo_restores_position() {
        let mut pos = Position::new();
        let fen_before = pos.fen();
        let key_before = pos.key();
        let pawn_key_before = pos.pawn_key();

        for mv in pos.legal_moves() {
            pos.do_move(mv);
            pos.undo_move();
            assert_eq!(pos.fen(), fen_before);
            assert_eq!(pos.key(), key_before);
            assert_eq!(pos.pawn_key(), pawn_key_before);
        }
    }

    #[test]
    fn null_move_round_trip() {
        let mut pos = Position::from_fen(
            "r1bqkbnr/pppp1ppp/2n5/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R w KQkq - 2 3",
            false,
        )
        .unwrap();
        let key = pos.key();
        assert!(pos.do_null_move());
        assert_ne!(pos.key(), key);
        pos.undo_null_move();
        assert_eq!(pos.key(), key);
    }

    #[test]
    fn en_passant_and_castling_flags() {
        let mut pos = Position::from_fen(
            "rnbqkbnr/ppp1p1pp/8/3pPp2/8/8/PPPP1PPP/RNBQKBNR w KQkq f6 0 3",
            false,
        )
        .unwrap();
        let ep = pos
            .legal_moves()
            .into_iter()
            .find(|&m| pos.is_en_passant(m))
            .expect("en passant available");
        assert!(pos.is_capture(ep));
        assert_eq!(pos.captured_piece(ep), Some(Piece::Pawn));
        let dirty = pos.do_move(ep);
        assert_eq!(dirty.num_subs, 2);
        assert_eq!(dirty.num_adds, 1);

        let mut pos = Position::from_fen(
            "r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1",
            false,
        )
        .unwrap();
        let castle = pos
            .legal_moves()
            .into_iter()
            .find(|&m| pos.is_castling(m))
            .expect("castling available");
        assert!(!pos.is_capture(castle));
        let dirty = pos.do_move(castle);
        assert_eq!(dirty.num_subs, 2);
        assert_eq!(dirty.num_adds, 2);
        assert!(dirty.moved_king(Color::White));
    }

    #[test]
    fn repetition_detected_inside_search() {
        let mut pos = Position::from_fen(
            "r1bqkbnr/pppp1ppp/2n5/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R w KQkq - 2 3",
            false,
        )
        .unwrap();
        for s in ["f3g1", "c6b8", "g1f3", "b8c6"] {
            pos.play_uci(s).unwrap();
        }
        // Position has now occurred twice; inside a search any ply > 4
        // treats the twofold as a draw.
        assert!(pos.is_repetition(5));
    }

    #[test]
    fn see_rejects_losing_exchange() {
        // Rxh7 loses the rook to Kxh7 (Titan's SEE regression position).
        let pos = Position::from_fen("6k1/2R4p/6p1/8/6K1/6P1/8/8 w - - 3 38", false).unwrap();
        let rxh7 = pos
            .legal_moves()
            .into_iter()
            .find(|m| m.from == Square::C7 && m.to == Square::H7)
            .unwrap();
        assert!(!pos.see_ge(rxh7, 0));
        assert!(pos.see_ge(rxh7, -crate::types::ROOK_VALUE));
    }

    #[test]
    fn see_accepts_winning_exchange() {
        // Pawn takes undefended pawn.
        let pos = Position::from_fen(
            "rnbqkbnr/pppp1ppp/8/4p3/3P4/8/PPP1PPPP/RNBQKBNR w KQkq - 0 2",
            false,
        )
        .unwrap();
        let dxe5 = pos
            .legal_moves()
            .into_iter()
            .find(|m| m.from == Square::D4 && m.to == Square::E5)
            .unwrap();
        assert!(pos.see_ge(dxe5, 0));
    }

    #[test]
    fn fen_round_trip() {
        let fens = [
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            "8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1",
            "r3k2r/Pppp1ppp/1b3nbN/nP6/BBP1P3/q4N2/Pp1P2PP/R2Q1RK1 w kq - 0 1",
        ];
        for fen in fens {
            let pos = Position::from_fen(fen, false).unwrap();
            assert_eq!(pos.fen(), fen);
        }
    }

    #[test]
    fn invalid_fen_is_an_error() {
        assert!(Position::from_fen("not a fen", false).is_err());
        assert!(Position::from_fen("8/8/8/8/8/8/8/8 w - - 0 1", false).is_err());
    }
}
