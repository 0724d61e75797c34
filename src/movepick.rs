//! Staged move ordering.
//!
//! The picker yields moves in the order the search wants to try them: the
//! transposition-table move first, then winning captures, quiets sorted by
//! the history stack, and losing captures last. Evasion, probcut and
//! quiescence pickers reuse the same machinery with smaller move sets.
//!
//! All candidate moves are scored up front when the picker is built; the
//! stages then just walk the pre-scored list. This keeps the history
//! borrows out of the emission loop.

use cozy_chess::Move;

use crate::history::{ContinuationKey, Histories, LOW_PLY_SIZE};
use crate::position::Position;
use crate::types::{piece_value, Depth, Value};

/// How many prior-move continuation slices feed quiet ordering.
pub const CONT_HIST_PLIES: usize = 6;

/// Only continuation slices at these distances count double.
const CONT_HIST_FULL: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    TtMove,
    GoodCaptures,
    Quiets,
    BadCaptures,
    Evasions,
    ProbCut,
    QCaptures,
    Done,
}

#[derive(Clone, Copy)]
struct ScoredMove {
    mv: Move,
    score: i32,
    tried: bool,
}

/// What the caller intends to do with the emitted moves; selects the
/// generation set and the ordering heuristics.
pub enum PickerKind<'a> {
    /// Main and PV nodes: full staged ordering.
    Main {
        histories: &'a Histories,
        cont_keys: &'a [Option<ContinuationKey>],
        ply: usize,
        depth: Depth,
    },
    /// In-check nodes: all evasions, one stage.
    Evasions {
        histories: &'a Histories,
        cont_keys: &'a [Option<ContinuationKey>],
    },
    /// Probcut: captures that beat a SEE threshold.
    ProbCut { threshold: Value },
    /// Quiescence: captures and queen promotions only.
    QSearch { histories: &'a Histories },
}

pub struct MovePicker {
    stage: Stage,
    after_tt: Stage,
    tt_move: Option<Move>,
    captures: Vec<ScoredMove>,
    quiets: Vec<ScoredMove>,
    bad_captures: Vec<ScoredMove>,
    skip_quiets: bool,
    see_threshold: Value,
}

impl MovePicker {
    pub fn new(pos: &Position, tt_move: Option<Move>, kind: PickerKind) -> Self {
        let tt_move = tt_move.filter(|&m| pos.is_legal(m));
        match kind {
            PickerKind::Main {
                histories,
                cont_keys,
                ply,
                depth,
            } => {
                let mut captures = Vec::new();
                let mut quiets = Vec::new();
                for mv in pos.legal_moves() {
                    if Some(mv) == tt_move {
                        continue;
                    }
                    if pos.is_capture_stage(mv) {
                        captures.push(ScoredMove {
                            mv,
                            score: capture_score(pos, histories, mv),
                            tried: false,
                        });
                    } else {
                        quiets.push(ScoredMove {
                            mv,
                            score: quiet_score(pos, histories, cont_keys, ply, mv),
                            tried: false,
                        });
                    }
                }
                captures.sort_by_key(|s| -s.score);
                // Quiets far below the depth-scaled floor are near-certain
                // to be pruned, so they stay unsorted at the tail.
                let floor = -3560 * depth.max(1);
                let cut = partition_above(&mut quiets, floor);
                quiets[..cut].sort_by_key(|s| -s.score);
                MovePicker {
                    stage: if tt_move.is_some() { Stage::TtMove } else { Stage::GoodCaptures },
                    after_tt: Stage::GoodCaptures,
                    tt_move,
                    captures,
                    quiets,
                    bad_captures: Vec::new(),
                    skip_quiets: false,
                    see_threshold: 0,
                }
            }
            PickerKind::Evasions { histories, cont_keys } => {
                let mut evasions: Vec<ScoredMove> = pos
                    .legal_moves()
                    .into_iter()
                    .filter(|&m| Some(m) != tt_move)
                    .map(|mv| {
                        // Captures of the checker first, then history order.
                        let score = if pos.is_capture_stage(mv) {
                            1 << 28 | pos.capture_value(mv)
                        } else {
                            quiet_score(pos, histories, cont_keys, cont_keys.len(), mv)
                        };
                        ScoredMove { mv, score, tried: false }
                    })
                    .collect();
                evasions.sort_by_key(|s| -s.score);
                MovePicker {
                    stage: if tt_move.is_some() { Stage::TtMove } else { Stage::Evasions },
                    after_tt: Stage::Evasions,
                    tt_move,
                    captures: evasions,
                    quiets: Vec::new(),
                    bad_captures: Vec::new(),
                    skip_quiets: false,
                    see_threshold: 0,
                }
            }
            PickerKind::ProbCut { threshold } => {
                let tt_move = tt_move
                    .filter(|&m| pos.is_capture_stage(m) && pos.see_ge(m, threshold));
                let mut captures: Vec<ScoredMove> = pos
                    .capture_stage_moves()
                    .into_iter()
                    .filter(|&m| Some(m) != tt_move)
                    .map(|mv| ScoredMove {
                        mv,
                        score: pos.capture_value(mv),
                        tried: false,
                    })
                    .collect();
                captures.sort_by_key(|s| -s.score);
                MovePicker {
                    stage: if tt_move.is_some() { Stage::TtMove } else { Stage::ProbCut },
                    after_tt: Stage::ProbCut,
                    tt_move,
                    captures,
                    quiets: Vec::new(),
                    bad_captures: Vec::new(),
                    skip_quiets: false,
                    see_threshold: threshold,
                }
            }
            PickerKind::QSearch { histories } => {
                let tt_move = tt_move.filter(|&m| pos.is_capture_stage(m));
                let mut captures: Vec<ScoredMove> = pos
                    .capture_stage_moves()
                    .into_iter()
                    .filter(|&m| Some(m) != tt_move)
                    .map(|mv| ScoredMove {
                        mv,
                        score: capture_score(pos, histories, mv),
                        tried: false,
                    })
                    .collect();
                captures.sort_by_key(|s| -s.score);
                MovePicker {
                    stage: if tt_move.is_some() { Stage::TtMove } else { Stage::QCaptures },
                    after_tt: Stage::QCaptures,
                    tt_move,
                    captures,
                    quiets: Vec::new(),
                    bad_captures: Vec::new(),
                    skip_quiets: false,
                    see_threshold: 0,
                }
            }
        }
    }

    /// Suppress the remaining quiet moves (movecount pruning).
    pub fn skip_quiet_moves(&mut self) {
        self.skip_quiets = true;
    }

    pub fn next(&mut self, pos: &Position) -> Option<Move> {
        loop {
            match self.stage {
                Stage::TtMove => {
                    self.stage = self.after_tt;
                    if let Some(mv) = self.tt_move {
                        return Some(mv);
                    }
                }
                Stage::GoodCaptures => {
                    if let Some(i) = self.captures.iter().position(|s| !s.tried) {
                        self.captures[i].tried = true;
                        let mv = self.captures[i].mv;
                        // SEE failures wait until the bad-capture stage.
                        if !pos.see_ge(mv, -self.captures[i].score / 18) {
                            self.bad_captures.push(self.captures[i]);
                            continue;
                        }
                        return Some(mv);
                    }
                    self.stage = Stage::Quiets;
                }
                Stage::Quiets => {
                    if !self.skip_quiets {
                        if let Some(i) = self.quiets.iter().position(|s| !s.tried) {
                            self.quiets[i].tried = true;
                            return Some(self.quiets[i].mv);
                        }
                    }
                    self.stage = Stage::BadCaptures;
                }
                Stage::BadCaptures => {
                    if let Some(i) = self.bad_captures.iter().position(|s| !s.tried) {
                        self.bad_captures[i].tried = true;
                        return Some(self.bad_captures[i].mv);
                    }
                    self.stage = Stage::Done;
                }
                Stage::Evasions | Stage::QCaptures => {
                    if let Some(i) = self.captures.iter().position(|s| !s.tried) {
                        self.captures[i].tried = true;
                        return Some(self.captures[i].mv);
                    }
                    self.stage = Stage::Done;
                }
                Stage::ProbCut => {
                    if let Some(i) = self.captures.iter().position(|s| !s.tried) {
                        self.captures[i].tried = true;
                        let mv = self.captures[i].mv;
                        if !pos.see_ge(mv, self.see_threshold) {
                            continue;
                        }
                        return Some(mv);
                    }
                    self.stage = Stage::Done;
                }
                Stage::Done => return None,
            }
        }
    }
}

/// Move entries scoring above `floor` to the front, returning how many.
fn partition_above(moves: &mut [ScoredMove], floor: i32) -> usize {
    let mut cut = 0;
    for i in 0..moves.len() {
        if moves[i].score > floor {
            moves.swap(cut, i);
            cut += 1;
        }
    }
    cut
}

/// Capture ordering: victim value dominates, capture history refines.
fn capture_score(pos: &Position, histories: &Histories, mv: Move) -> i32 {
    let moved = pos.moved_piece(mv);
    let captured = pos
        .captured_piece(mv)
        .unwrap_or(cozy_chess::Piece::Queen);
    7 * piece_value(captured) + histories.capture.get(moved, mv.to, captured)
}

/// Quiet ordering: butterfly plus the continuation-history stack plus the
/// pawn-structure table, with a low-ply boost near the root.
fn quiet_score(
    pos: &Position,
    histories: &Histories,
    cont_keys: &[Option<ContinuationKey>],
    ply: usize,
    mv: Move,
) -> i32 {
    let us = pos.side_to_move();
    let piece = pos.moved_piece(mv);
    let mut score = 2 * histories.butterfly.get(us, mv);
    score += 2 * histories.pawn.get(pos.pawn_key(), piece, mv.to);
    for (i, key) in cont_keys.iter().rev().take(CONT_HIST_PLIES).enumerate() {
        if let Some(key) = key {
            let weight = if i < CONT_HIST_FULL { 2 } else { 1 };
            score += weight * histories.continuation.get(key, piece, mv.to);
        }
    }
    if ply < LOW_PLY_SIZE {
        score += 8 * histories.low_ply.get(ply, mv) / (1 + ply as i32);
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(picker: &mut MovePicker, pos: &Position) -> Vec<Move> {
        let mut out = Vec::new();
        while let Some(mv) = picker.next(pos) {
            out.push(mv);
        }
        out
    }

    #[test]
    fn yields_every_legal_move_exactly_once() {
        let pos = Position::new();
        let histories = Histories::new();
        let cont_keys: Vec<Option<ContinuationKey>> = Vec::new();
        let mut picker = MovePicker::new(
            &pos,
            None,
            PickerKind::Main {
                histories: &histories,
                cont_keys: &cont_keys,
                ply: 0,
                depth: 4,
            },
        );
        let mut moves = drain(&mut picker, &pos);
        moves.sort_by_key(|m| m.to_string());
        let mut legal = pos.legal_moves();
        legal.sort_by_key(|m| m.to_string());
        assert_eq!(moves, legal);
    }

    #[test]
    fn tt_move_comes_first() {
        let pos = Position::new();
        let histories = Histories::new();
        let tt = cozy_chess::util::parse_uci_move(pos.board(), "d2d4").unwrap();
        let cont_keys: Vec<Option<ContinuationKey>> = Vec::new();
        let mut picker = MovePicker::new(
            &pos,
            Some(tt),
            PickerKind::Main {
                histories: &histories,
                cont_keys: &cont_keys,
                ply: 0,
                depth: 4,
            },
        );
        assert_eq!(picker.next(&pos), Some(tt));
        let rest = drain(&mut picker, &pos);
        assert!(!rest.contains(&tt));
        assert_eq!(rest.len(), pos.legal_moves().len() - 1);
    }

    #[test]
    fn winning_capture_precedes_quiets() {
        // White queen takes a hanging rook.
        let pos = Position::from_fen("4k3/8/8/3r4/8/8/3Q4/4K3 w - - 0 1", false).unwrap();
        let histories = Histories::new();
        let cont_keys: Vec<Option<ContinuationKey>> = Vec::new();
        let mut picker = MovePicker::new(
            &pos,
            None,
            PickerKind::Main {
                histories: &histories,
                cont_keys: &cont_keys,
                ply: 0,
                depth: 4,
            },
        );
        let first = picker.next(&pos).unwrap();
        assert_eq!(pos.move_to_uci(first), "d2d5");
    }

    #[test]
    fn history_reorders_quiets() {
        let pos = Position::new();
        let mut histories = Histories::new();
        let boosted = cozy_chess::util::parse_uci_move(pos.board(), "b1c3").unwrap();
        for _ in 0..8 {
            histories.butterfly.update(pos.side_to_move(), boosted, 2000);
        }
        let cont_keys: Vec<Option<ContinuationKey>> = Vec::new();
        let mut picker = MovePicker::new(
            &pos,
            None,
            PickerKind::Main {
                histories: &histories,
                cont_keys: &cont_keys,
                ply: 0,
                depth: 4,
            },
        );
        // No captures at the start position, so the boosted quiet leads.
        assert_eq!(picker.next(&pos), Some(boosted));
    }

    #[test]
    fn skip_quiets_still_emits_bad_captures() {
        // Rook takes a defended pawn: a losing capture.
        let pos = Position::from_fen("4k3/2p5/3p4/8/8/8/3R4/4K3 w - - 0 1", false).unwrap();
        let histories = Histories::new();
        let cont_keys: Vec<Option<ContinuationKey>> = Vec::new();
        let mut picker = MovePicker::new(
            &pos,
            None,
            PickerKind::Main {
                histories: &histories,
                cont_keys: &cont_keys,
                ply: 0,
                depth: 4,
            },
        );
        picker.skip_quiet_moves();
        let moves = drain(&mut picker, &pos);
        assert!(moves.iter().any(|&m| pos.move_to_uci(m) == "d2d6"));
        assert!(moves.iter().all(|&m| pos.is_capture_stage(m)));
    }

    #[test]
    fn evasion_picker_only_yields_legal_evasions() {
        let pos = Position::from_fen("4k3/8/8/8/8/8/4r3/4K3 w - - 0 1", false).unwrap();
        assert!(pos.in_check());
        let histories = Histories::new();
        let cont_keys: Vec<Option<ContinuationKey>> = Vec::new();
        let mut picker = MovePicker::new(
            &pos,
            None,
            PickerKind::Evasions {
                histories: &histories,
                cont_keys: &cont_keys,
            },
        );
        let mut moves = drain(&mut picker, &pos);
        moves.sort_by_key(|m| m.to_string());
        let mut legal = pos.legal_moves();
        legal.sort_by_key(|m| m.to_string());
        assert_eq!(moves, legal);
    }

    #[test]
    fn probcut_picker_filters_by_see() {
        // Queen can take a hanging rook on d5 or a defended pawn on d6.
        let pos =
            Position::from_fen("4k3/2p5/3p4/3r4/8/8/3Q4/4K3 w - - 0 1", false).unwrap();
        let mut picker = MovePicker::new(&pos, None, PickerKind::ProbCut { threshold: 200 });
        let moves = drain(&mut picker, &pos);
        assert!(moves.iter().any(|&m| pos.move_to_uci(m) == "d2d5"));
        assert!(moves.iter().all(|&m| pos.move_to_uci(m) != "d2d6"));
    }
}
