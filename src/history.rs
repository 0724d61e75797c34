//! Move-history heuristics.
//!
//! All tables share one update rule ("gravity"): `stat += bonus - stat *
//! |bonus| / LIMIT`, which saturates smoothly at `±LIMIT`. The limits differ
//! per table and are plain tuning constants.

use cozy_chess::{Color, Move, Piece, Square};

use crate::types::Value;

pub const BUTTERFLY_LIMIT: i32 = 7183;
pub const LOW_PLY_LIMIT: i32 = 7183;
pub const CAPTURE_LIMIT: i32 = 10692;
pub const CONTINUATION_LIMIT: i32 = 29952;
pub const PAWN_HISTORY_LIMIT: i32 = 8192;
pub const CORRECTION_LIMIT: i32 = 1024;

/// Plies from the root covered by the low-ply history.
pub const LOW_PLY_SIZE: usize = 5;
/// Buckets of the pawn-structure keyed history.
pub const PAWN_HISTORY_SIZE: usize = 512;
/// Buckets per correction table.
const CORRECTION_SIZE: usize = 16384;

const FROM_TO: usize = 64 * 64;
const PIECE_TO: usize = 6 * 64;

#[inline]
fn gravity(entry: &mut i16, bonus: i32, limit: i32) {
    let bonus = bonus.clamp(-limit, limit);
    let v = i32::from(*entry);
    *entry = (v + bonus - v * bonus.abs() / limit) as i16;
}

#[inline]
fn from_to(mv: Move) -> usize {
    mv.from as usize * 64 + mv.to as usize
}

#[inline]
fn piece_to(piece: Piece, to: Square) -> usize {
    piece as usize * 64 + to as usize
}

/// `[color][from-to]` history of quiet moves.
pub struct ButterflyHistory {
    entries: Box<[[i16; FROM_TO]; 2]>,
}

impl ButterflyHistory {
    #[must_use]
    pub fn new() -> Self {
        ButterflyHistory {
            entries: Box::new([[0; FROM_TO]; 2]),
        }
    }

    #[must_use]
    pub fn get(&self, color: Color, mv: Move) -> i32 {
        i32::from(self.entries[color as usize][from_to(mv)])
    }

    pub fn update(&mut self, color: Color, mv: Move, bonus: i32) {
        gravity(&mut self.entries[color as usize][from_to(mv)], bonus, BUTTERFLY_LIMIT);
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|t| t.fill(0));
    }
}

/// `[ply][from-to]` bias for moves near the root.
pub struct LowPlyHistory {
    entries: Box<[[i16; FROM_TO]; LOW_PLY_SIZE]>,
}

impl LowPlyHistory {
    #[must_use]
    pub fn new() -> Self {
        LowPlyHistory {
            entries: Box::new([[0; FROM_TO]; LOW_PLY_SIZE]),
        }
    }

    #[must_use]
    pub fn get(&self, ply: usize, mv: Move) -> i32 {
        if ply < LOW_PLY_SIZE {
            i32::from(self.entries[ply][from_to(mv)])
        } else {
            0
        }
    }

    pub fn update(&mut self, ply: usize, mv: Move, bonus: i32) {
        if ply < LOW_PLY_SIZE {
            gravity(&mut self.entries[ply][from_to(mv)], bonus, LOW_PLY_LIMIT);
        }
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|t| t.fill(0));
    }
}

/// `[moved piece][to][captured type]` history of captures.
pub struct CaptureHistory {
    entries: Box<[[[i16; 6]; 64]; 6]>,
}

impl CaptureHistory {
    #[must_use]
    pub fn new() -> Self {
        CaptureHistory {
            entries: Box::new([[[0; 6]; 64]; 6]),
        }
    }

    #[must_use]
    pub fn get(&self, moved: Piece, to: Square, captured: Piece) -> i32 {
        i32::from(self.entries[moved as usize][to as usize][captured as usize])
    }

    pub fn update(&mut self, moved: Piece, to: Square, captured: Piece, bonus: i32) {
        gravity(
            &mut self.entries[moved as usize][to as usize][captured as usize],
            bonus,
            CAPTURE_LIMIT,
        );
    }

    pub fn clear(&mut self) {
        for a in self.entries.iter_mut() {
            for b in a.iter_mut() {
                b.fill(0);
            }
        }
    }
}

/// Key addressing one slice of the continuation history: the move that was
/// just played, plus the node flavor it was played in. Stored in the search
/// stack instead of a raw table pointer.
#[derive(Clone, Copy, Debug)]
pub struct ContinuationKey {
    pub in_check: bool,
    pub capture: bool,
    pub piece: Piece,
    pub to: Square,
}

/// `[inCheck][wasCapture][prevPiece][prevTo] -> [piece][to]` history.
pub struct ContinuationHistory {
    entries: Vec<Box<[[i16; PIECE_TO]; PIECE_TO]>>,
}

impl ContinuationHistory {
    #[must_use]
    pub fn new() -> Self {
        ContinuationHistory {
            entries: (0..4).map(|_| Box::new([[0; PIECE_TO]; PIECE_TO])).collect(),
        }
    }

    #[inline]
    fn quadrant(key: &ContinuationKey) -> usize {
        usize::from(key.in_check) * 2 + usize::from(key.capture)
    }

    #[must_use]
    pub fn get(&self, key: &ContinuationKey, piece: Piece, to: Square) -> i32 {
        i32::from(
            self.entries[Self::quadrant(key)][piece_to(key.piece, key.to)][piece_to(piece, to)],
        )
    }

    pub fn update(&mut self, key: &ContinuationKey, piece: Piece, to: Square, bonus: i32) {
        gravity(
            &mut self.entries[Self::quadrant(key)][piece_to(key.piece, key.to)]
                [piece_to(piece, to)],
            bonus,
            CONTINUATION_LIMIT,
        );
    }

    pub fn clear(&mut self) {
        for quadrant in &mut self.entries {
            for row in quadrant.iter_mut() {
                row.fill(0);
            }
        }
    }
}

/// `[pawn-structure bucket][piece][to]` history of quiet moves.
pub struct PawnHistory {
    entries: Box<[[[i16; 64]; 6]; PAWN_HISTORY_SIZE]>,
}

impl PawnHistory {
    #[must_use]
    pub fn new() -> Self {
        PawnHistory {
            entries: vec![[[0; 64]; 6]; PAWN_HISTORY_SIZE]
                .into_boxed_slice()
                .try_into()
                .expect("sized vector"),
        }
    }

    #[inline]
    #[must_use]
    pub fn index(pawn_key: u64) -> usize {
        pawn_key as usize & (PAWN_HISTORY_SIZE - 1)
    }

    #[must_use]
    pub fn get(&self, pawn_key: u64, piece: Piece, to: Square) -> i32 {
        i32::from(self.entries[Self::index(pawn_key)][piece as usize][to as usize])
    }

    pub fn update(&mut self, pawn_key: u64, piece: Piece, to: Square, bonus: i32) {
        gravity(
            &mut self.entries[Self::index(pawn_key)][piece as usize][to as usize],
            bonus,
            PAWN_HISTORY_LIMIT,
        );
    }

    pub fn clear(&mut self) {
        for bucket in self.entries.iter_mut() {
            for row in bucket.iter_mut() {
                row.fill(0);
            }
        }
    }
}

/// One material-keyed static-eval correction table.
pub struct CorrectionHistory {
    entries: Box<[[i16; CORRECTION_SIZE]; 2]>,
}

impl CorrectionHistory {
    #[must_use]
    pub fn new() -> Self {
        CorrectionHistory {
            entries: vec![[0; CORRECTION_SIZE]; 2]
                .into_boxed_slice()
                .try_into()
                .expect("sized vector"),
        }
    }

    #[inline]
    fn index(key: u64) -> usize {
        key as usize & (CORRECTION_SIZE - 1)
    }

    #[must_use]
    pub fn get(&self, color: Color, key: u64) -> i32 {
        i32::from(self.entries[color as usize][Self::index(key)])
    }

    pub fn update(&mut self, color: Color, key: u64, bonus: i32) {
        gravity(&mut self.entries[color as usize][Self::index(key)], bonus, CORRECTION_LIMIT);
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|t| t.fill(0));
    }
}

/// All per-thread history state, owned by one search worker.
pub struct Histories {
    pub butterfly: ButterflyHistory,
    pub low_ply: LowPlyHistory,
    pub capture: CaptureHistory,
    pub continuation: ContinuationHistory,
    pub pawn: PawnHistory,
    pub pawn_correction: CorrectionHistory,
    pub minor_correction: CorrectionHistory,
    pub non_pawn_correction: [CorrectionHistory; 2],
    pub continuation_correction: ContinuationHistory,
}

impl Histories {
    #[must_use]
    pub fn new() -> Self {
        Histories {
            butterfly: ButterflyHistory::new(),
            low_ply: LowPlyHistory::new(),
            capture: CaptureHistory::new(),
            continuation: ContinuationHistory::new(),
            pawn: PawnHistory::new(),
            pawn_correction: CorrectionHistory::new(),
            minor_correction: CorrectionHistory::new(),
            non_pawn_correction: [CorrectionHistory::new(), CorrectionHistory::new()],
            continuation_correction: ContinuationHistory::new(),
        }
    }

    pub fn clear(&mut self) {
        self.butterfly.clear();
        self.low_ply.clear();
        self.capture.clear();
        self.continuation.clear();
        self.pawn.clear();
        self.pawn_correction.clear();
        self.minor_correction.clear();
        self.non_pawn_correction.iter_mut().for_each(CorrectionHistory::clear);
        self.continuation_correction.clear();
    }
}

impl Default for Histories {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp a raw static eval corrected by the weighted correction sum `cv`
/// into the non-terminal score range.
#[must_use]
pub fn to_corrected_static_eval(raw: Value, cv: i32) -> Value {
    use crate::types::{VALUE_TB_LOSS_IN_MAX_PLY, VALUE_TB_WIN_IN_MAX_PLY};
    (raw + cv / 131_072).clamp(VALUE_TB_LOSS_IN_MAX_PLY + 1, VALUE_TB_WIN_IN_MAX_PLY - 1)
}
