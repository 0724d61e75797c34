//! Iterative-deepening alpha-beta search.
//!
//! Every worker thread runs the same deepening loop over its own clone of
//! the root position. Workers share only the transposition table and the
//! stop flag; histories, the search stack and the NNUE accumulators are
//! thread private. The main worker (thread 0) additionally owns the time
//! manager and the progress callbacks.

pub mod params;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cozy_chess::{Color, Move, Piece};
use log::debug;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::history::{ContinuationKey, Histories, CORRECTION_LIMIT, LOW_PLY_SIZE};
use crate::movepick::{MovePicker, PickerKind, CONT_HIST_PLIES};
use crate::nnue::{self, AccumulatorStack, Networks, RefreshTable};
use crate::position::Position;
use crate::tb::{TbConfig, Tablebases};
use crate::timeman::TimeManager;
use crate::tt::{value_draw, value_from_tt, value_to_tt, TTData, TranspositionTable};
use crate::types::{
    is_decisive, is_loss, is_win, mate_in, mated_in, wdl_model, Bound, Depth, Score, Value,
    WdlStats, MAX_MOVES, MAX_PLY, VALUE_DRAW, VALUE_INFINITE, VALUE_NONE, VALUE_ZERO,
    PAWN_VALUE, VALUE_TB_LOSS_IN_MAX_PLY,
};

use params::*;

/// Guard entries below ply zero so `ss - N` lookups never underflow.
const STACK_OFFSET: usize = 7;

/// Everything `go` can constrain.
#[derive(Clone, Debug)]
pub struct LimitsType {
    pub start_time: Instant,
    /// Remaining clock per color, milliseconds. Zero means no clock.
    pub time: [i64; 2],
    pub inc: [i64; 2],
    pub movestogo: i32,
    pub depth: Option<Depth>,
    pub movetime: Option<i64>,
    pub mate: Option<i32>,
    pub nodes: Option<u64>,
    pub infinite: bool,
    pub ponder: bool,
    pub perft: Option<Depth>,
    /// UCI move strings restricting the root, empty for all moves.
    pub searchmoves: Vec<String>,
}

impl Default for LimitsType {
    fn default() -> Self {
        LimitsType {
            start_time: Instant::now(),
            time: [0, 0],
            inc: [0, 0],
            movestogo: 0,
            depth: None,
            movetime: None,
            mate: None,
            nodes: None,
            infinite: false,
            ponder: false,
            perft: None,
            searchmoves: Vec::new(),
        }
    }
}

impl LimitsType {
    #[must_use]
    pub fn use_time_management(&self) -> bool {
        self.time[0] > 0 || self.time[1] > 0
    }
}

/// Option snapshot taken at `go` time; immutable for the whole search.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub threads: usize,
    pub multi_pv: usize,
    /// 0..=19 weakens play; 20 disables the handicap.
    pub skill_level: i32,
    pub move_overhead: i64,
    pub nodestime: i64,
    pub show_wdl: bool,
    pub tb: TbConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            threads: 1,
            multi_pv: 1,
            skill_level: 20,
            move_overhead: 10,
            nodestime: 0,
            show_wdl: false,
            tb: TbConfig::default(),
        }
    }
}

// ----------------------------------------------------------------------
// Progress callbacks.
// ----------------------------------------------------------------------

pub struct UpdateFullInfo {
    pub depth: Depth,
    pub sel_depth: i32,
    pub multipv: usize,
    pub score: Score,
    pub wdl: Option<WdlStats>,
    pub bound: Option<Bound>,
    pub nodes: u64,
    pub nps: u64,
    pub hashfull: u32,
    pub tb_hits: u64,
    pub time_ms: i64,
    pub pv: String,
}

pub struct UpdateNoMovesInfo {
    pub depth: Depth,
    pub score: Score,
}

pub struct IterInfo {
    pub depth: Depth,
    pub currmove: String,
    pub currmovenumber: usize,
}

pub struct BestMoveInfo {
    pub bestmove: String,
    pub ponder: Option<String>,
}

type Callback<T> = Option<Box<dyn Fn(&T) + Send + Sync>>;

#[derive(Default)]
pub struct Callbacks {
    pub on_update_full: Callback<UpdateFullInfo>,
    pub on_update_no_moves: Callback<UpdateNoMovesInfo>,
    pub on_iter: Callback<IterInfo>,
    pub on_bestmove: Callback<BestMoveInfo>,
}

// ----------------------------------------------------------------------
// Shared per-search state.
// ----------------------------------------------------------------------

/// Result a worker publishes when its deepening loop ends.
#[derive(Clone, Default)]
pub struct ThreadResult {
    pub root_moves: Vec<RootMove>,
    pub completed_depth: Depth,
}

/// State shared by every worker of one `go`. Created fresh per search.
pub struct SharedSearch {
    pub tt: Arc<TranspositionTable>,
    pub networks: Arc<Networks>,
    pub tb: Arc<dyn Tablebases>,
    pub stop: AtomicBool,
    pub stop_on_ponderhit: AtomicBool,
    pub ponder: AtomicBool,
    pub increase_depth: AtomicBool,
    pub nodes: Vec<AtomicU64>,
    pub tb_hits: Vec<AtomicU64>,
    /// Best-move flips per thread, in thousandths for the decay math.
    pub best_move_changes: Vec<AtomicU64>,
    pub results: Vec<Mutex<ThreadResult>>,
    pub config: SearchConfig,
    pub limits: LimitsType,
    pub callbacks: Callbacks,
}

impl SharedSearch {
    pub fn new(
        tt: Arc<TranspositionTable>,
        networks: Arc<Networks>,
        tb: Arc<dyn Tablebases>,
        config: SearchConfig,
        limits: LimitsType,
        callbacks: Callbacks,
    ) -> Self {
        let threads = config.threads.max(1);
        SharedSearch {
            tt,
            networks,
            tb,
            stop: AtomicBool::new(false),
            stop_on_ponderhit: AtomicBool::new(false),
            ponder: AtomicBool::new(limits.ponder),
            increase_depth: AtomicBool::new(true),
            nodes: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            tb_hits: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            best_move_changes: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            results: (0..threads).map(|_| Mutex::new(ThreadResult::default())).collect(),
            config,
            limits,
            callbacks,
        }
    }

    #[must_use]
    pub fn nodes_searched(&self) -> u64 {
        self.nodes.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }

    #[must_use]
    pub fn tb_hits_total(&self) -> u64 {
        self.tb_hits.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }

    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

// ----------------------------------------------------------------------
// Root moves and the per-ply search stack.
// ----------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RootMove {
    pub mv: Move,
    pub pv: Vec<Move>,
    pub score: Value,
    pub previous_score: Value,
    pub average_score: Value,
    pub mean_squared_score: i64,
    pub uci_score: Value,
    pub score_lowerbound: bool,
    pub score_upperbound: bool,
    pub sel_depth: i32,
    pub tb_rank: i32,
    pub tb_score: Value,
    pub effort: u64,
}

impl RootMove {
    #[must_use]
    pub fn new(mv: Move) -> Self {
        RootMove {
            mv,
            pv: vec![mv],
            score: -VALUE_INFINITE,
            previous_score: -VALUE_INFINITE,
            average_score: -VALUE_INFINITE,
            mean_squared_score: -(i64::from(VALUE_INFINITE) * i64::from(VALUE_INFINITE)),
            uci_score: -VALUE_INFINITE,
            score_lowerbound: false,
            score_upperbound: false,
            sel_depth: 0,
            tb_rank: 0,
            tb_score: 0,
            effort: 0,
        }
    }

    /// Descending order by current score, previous score breaking ties.
    fn sort_key(&self) -> (Value, Value) {
        (self.score, self.previous_score)
    }
}

#[derive(Clone)]
struct Stack {
    pv: Vec<Move>,
    current_move: Option<Move>,
    excluded: Option<Move>,
    cont_key: Option<ContinuationKey>,
    static_eval: Value,
    stat_score: i32,
    move_count: i32,
    in_check: bool,
    tt_pv: bool,
    cutoff_cnt: i32,
    reduction: i32,
    quiet_move_streak: i32,
}

impl Default for Stack {
    fn default() -> Self {
        Stack {
            pv: Vec::new(),
            current_move: None,
            excluded: None,
            cont_key: None,
            static_eval: VALUE_NONE,
            stat_score: 0,
            move_count: 0,
            in_check: false,
            tt_pv: false,
            cutoff_cnt: 0,
            reduction: 0,
            quiet_move_streak: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NodeType {
    Root,
    Pv,
    NonPv,
}

// ----------------------------------------------------------------------
// Worker.
// ----------------------------------------------------------------------

pub struct Worker {
    pub thread_id: usize,
    pub histories: Histories,
    rng: SmallRng,

    pos: Position,
    stack: Vec<Stack>,
    accumulators: AccumulatorStack,
    refresh: RefreshTable,
    pub root_moves: Vec<RootMove>,
    pub completed_depth: Depth,
    root_depth: Depth,
    sel_depth: i32,
    root_delta: Value,
    nmp_min_ply: i32,
    pv_idx: usize,
    pv_last: usize,
    optimism: [Value; 2],
    nodes: u64,
    calls_cnt: i32,

    // Main-thread search manager state, persisted across searches.
    tm: TimeManager,
    previous_time_reduction: f64,
    best_previous_score: Value,
    best_previous_average_score: Value,
}

impl Worker {
    #[must_use]
    pub fn new(thread_id: usize) -> Self {
        Worker {
            thread_id,
            histories: Histories::new(),
            rng: SmallRng::seed_from_u64(0x9e37_79b9_7f4a_7c15 ^ thread_id as u64),
            pos: Position::new(),
            stack: Vec::new(),
            accumulators: AccumulatorStack::new(),
            refresh: RefreshTable::new(&Networks::material_baseline()),
            root_moves: Vec::new(),
            completed_depth: 0,
            root_depth: 0,
            sel_depth: 0,
            root_delta: 1,
            nmp_min_ply: 0,
            pv_idx: 0,
            pv_last: 0,
            optimism: [0, 0],
            nodes: 0,
            calls_cnt: 0,
            tm: TimeManager::new(),
            previous_time_reduction: 1.0,
            best_previous_score: VALUE_INFINITE,
            best_previous_average_score: VALUE_INFINITE,
        }
    }

    fn is_main(&self) -> bool {
        self.thread_id == 0
    }

    /// Forget everything learned in previous games.
    pub fn clear(&mut self) {
        self.histories.clear();
        self.previous_time_reduction = 1.0;
        self.best_previous_score = VALUE_INFINITE;
        self.best_previous_average_score = VALUE_INFINITE;
    }

    /// Run one full search on `root`. Blocks until done or stopped, then
    /// publishes the result into `shared.results[thread_id]`.
    pub fn start_search(&mut self, shared: &SharedSearch, root: Position) {
        self.pos = root;
        self.refresh = RefreshTable::new(&shared.networks);
        self.accumulators.reset(&self.pos, &shared.networks);
        self.stack = vec![Stack::default(); MAX_PLY + STACK_OFFSET + 3];
        self.nodes = 0;
        self.calls_cnt = 0;
        self.completed_depth = 0;
        self.root_depth = 0;
        self.sel_depth = 0;
        self.nmp_min_ply = 0;
        self.optimism = [0, 0];

        self.root_moves = self
            .pos
            .legal_moves()
            .into_iter()
            .filter(|&m| {
                shared.limits.searchmoves.is_empty()
                    || shared.limits.searchmoves.iter().any(|s| self.pos.move_to_uci(m) == *s)
            })
            .map(RootMove::new)
            .collect();

        if self.is_main() {
            let adjust = 1.0;
            self.tm.init(
                &shared.limits,
                self.pos.side_to_move(),
                self.pos.game_ply(),
                shared.config.move_overhead,
                shared.config.nodestime,
                adjust,
            );
            shared.tt.new_search();
        }

        if self.root_moves.is_empty() {
            if self.is_main() {
                let score = if self.pos.in_check() { mated_in(0) } else { VALUE_DRAW };
                if let Some(cb) = &shared.callbacks.on_update_no_moves {
                    cb(&UpdateNoMovesInfo { depth: 0, score: Score::from_value(score) });
                }
            }
            self.publish(shared);
            return;
        }

        let root_in_tb = shared
            .tb
            .rank_root_moves(&self.pos, &mut self.root_moves, &shared.config.tb);

        self.iterative_deepening(shared, root_in_tb);
        self.publish(shared);

        if self.is_main() {
            self.best_previous_score = self.root_moves[0].score;
            self.best_previous_average_score = self.root_moves[0].average_score;
            self.tm.consume_nodes(shared.nodes_searched());
        }
    }

    fn publish(&self, shared: &SharedSearch) {
        let mut slot = shared.results[self.thread_id].lock();
        slot.root_moves = self.root_moves.clone();
        slot.completed_depth = self.completed_depth;
    }

    // ------------------------------------------------------------------
    // Iterative deepening.
    // ------------------------------------------------------------------

    fn iterative_deepening(&mut self, shared: &SharedSearch, root_in_tb: bool) {
        let is_main = self.is_main();
        let us = self.pos.side_to_move();
        let mut skill = Skill::new(shared.config.skill_level);
        let multi_pv = {
            let base = shared.config.multi_pv.max(1);
            let base = if skill.enabled() { base.max(4) } else { base };
            base.min(self.root_moves.len())
        };

        let mut last_best_move = self.root_moves[0].mv;
        let mut last_best_depth: Depth = 0;
        let mut total_best_move_changes = 0.0_f64;
        let mut time_reduction = 1.0_f64;
        let mut iter_delay = 0;

        while self.root_depth < MAX_PLY as Depth - 1 {
            self.root_depth += 1;
            if shared.stopped() {
                break;
            }
            if let Some(limit) = shared.limits.depth {
                if self.root_depth > limit {
                    break;
                }
            }
            // Helpers deepen less aggressively when the manager says the
            // current iteration is probably the last.
            if !is_main && !shared.increase_depth.load(Ordering::Relaxed) {
                iter_delay += 1;
                if iter_delay & 1 == 1 {
                    self.root_depth -= 1;
                    continue;
                }
            }

            if is_main {
                total_best_move_changes /= 2.0;
            }
            for rm in &mut self.root_moves {
                rm.previous_score = rm.score;
            }

            self.pv_last = 0;
            let mut pv_idx = 0;
            while pv_idx < multi_pv && !shared.stopped() {
                self.pv_idx = pv_idx;
                if pv_idx >= self.pv_last {
                    self.pv_last = if root_in_tb {
                        let rank = self.root_moves[pv_idx].tb_rank;
                        self.root_moves[pv_idx..]
                            .iter()
                            .position(|rm| rm.tb_rank != rank)
                            .map_or(self.root_moves.len(), |off| pv_idx + off)
                    } else {
                        self.root_moves.len()
                    };
                }
                self.sel_depth = 0;

                // Aspiration window around the running average.
                let avg = match self.root_moves[pv_idx].average_score {
                    v if v == -VALUE_INFINITE => VALUE_ZERO,
                    v => v,
                };
                let mut delta = ASPIRATION_DELTA_BASE
                    + (i64::from(avg) * i64::from(avg) / ASPIRATION_DELTA_DIV) as Value;
                let mut alpha = (avg - delta).max(-VALUE_INFINITE);
                let mut beta = (avg + delta).min(VALUE_INFINITE);
                if self.root_depth < ASPIRATION_MIN_DEPTH {
                    alpha = -VALUE_INFINITE;
                    beta = VALUE_INFINITE;
                }
                self.optimism[us as usize] = 138 * avg / (avg.abs() + 81);
                self.optimism[!us as usize] = -self.optimism[us as usize];

                let mut failed_high_cnt: Depth = 0;
                loop {
                    let adjusted = (self.root_depth - failed_high_cnt).max(1);
                    self.root_delta = beta - alpha;
                    let value = self.search(shared, NodeType::Root, alpha, beta, adjusted, false, 0);
                    self.sort_root_moves(pv_idx, self.pv_last);
                    if shared.stopped() {
                        break;
                    }

                    if is_main
                        && multi_pv == 1
                        && (value <= alpha || value >= beta)
                        && self.tm.elapsed_time() > 3000
                    {
                        self.emit_pv(shared, multi_pv);
                    }

                    if value <= alpha {
                        beta = (alpha + beta) / 2;
                        alpha = (value - delta).max(-VALUE_INFINITE);
                        failed_high_cnt = 0;
                        if is_main {
                            shared.stop_on_ponderhit.store(false, Ordering::Relaxed);
                        }
                    } else if value >= beta {
                        beta = (value + delta).min(VALUE_INFINITE);
                        failed_high_cnt += 1;
                    } else {
                        break;
                    }
                    delta += delta / 3;
                }

                self.sort_root_moves(0, pv_idx + 1);
                if is_main
                    && (shared.stopped() || pv_idx + 1 == multi_pv || self.tm.elapsed_time() > 3000)
                {
                    self.emit_pv(shared, multi_pv);
                }
                pv_idx += 1;
            }

            if !shared.stopped() {
                self.completed_depth = self.root_depth;
            }

            // A new best move resets the stability clock.
            if self.root_moves[0].mv != last_best_move {
                last_best_move = self.root_moves[0].mv;
                last_best_depth = self.root_depth;
            }

            if let Some(mate) = shared.limits.mate {
                let v = self.root_moves[0].score;
                if is_win(v) && crate::types::VALUE_MATE - v <= 2 * mate {
                    shared.stop.store(true, Ordering::Relaxed);
                }
            }

            if skill.enabled() && skill.time_to_pick(self.root_depth) {
                skill.pick_best(&self.root_moves, multi_pv, &mut self.rng);
            }

            if !is_main {
                continue;
            }

            // Time management for the next iteration.
            if shared.limits.use_time_management()
                && !shared.stopped()
                && !shared.stop_on_ponderhit.load(Ordering::Relaxed)
            {
                for slot in &shared.best_move_changes {
                    total_best_move_changes += slot.swap(0, Ordering::Relaxed) as f64;
                }
                let best_value = self.root_moves[0].score;
                let prev_best = if self.best_previous_score == VALUE_INFINITE {
                    best_value
                } else {
                    self.best_previous_score
                };
                let prev_avg = if self.best_previous_average_score == VALUE_INFINITE {
                    best_value
                } else {
                    self.best_previous_average_score
                };

                let falling_eval = ((11.0
                    + 2.0 * f64::from(prev_avg - best_value)
                    + 0.8 * f64::from(prev_best - best_value))
                    / 100.0)
                    .clamp(FALLING_EVAL_CLAMP.0, FALLING_EVAL_CLAMP.1);

                time_reduction = if last_best_depth + 8 < self.completed_depth { 1.68 } else { 0.68 };
                let reduction = (1.454 + self.previous_time_reduction) / (2.159 * time_reduction);
                let instability = INSTABILITY_BASE
                    + INSTABILITY_MULT * total_best_move_changes / shared.config.threads as f64;

                let mut total_time =
                    self.tm.optimum() as f64 * falling_eval * reduction * instability;
                if self.root_moves.len() == 1 {
                    total_time = total_time.min(500.0);
                }

                let elapsed = self.tm.elapsed(|| shared.nodes_searched());
                if elapsed as f64 > total_time {
                    if shared.ponder.load(Ordering::Relaxed) {
                        shared.stop_on_ponderhit.store(true, Ordering::Relaxed);
                    } else {
                        shared.stop.store(true, Ordering::Relaxed);
                    }
                } else {
                    shared.increase_depth.store(
                        !(elapsed as f64 > total_time * 0.506),
                        Ordering::Relaxed,
                    );
                }
            }
        }

        self.previous_time_reduction = time_reduction;

        // The handicapped pick replaces the top root move so the pool's
        // vote sees the weakened choice.
        if skill.enabled() {
            if let Some(best) = skill.best {
                if let Some(i) = self.root_moves.iter().position(|rm| rm.mv == best) {
                    self.root_moves.swap(0, i);
                }
            }
        }
        debug!(
            "thread {} finished at depth {} ({} nodes)",
            self.thread_id, self.completed_depth, self.nodes
        );
    }

    fn sort_root_moves(&mut self, from: usize, to: usize) {
        self.root_moves[from..to].sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
    }

    /// Emit `info` lines for all PV indices searched so far this depth.
    fn emit_pv(&self, shared: &SharedSearch, multi_pv: usize) {
        let Some(cb) = &shared.callbacks.on_update_full else {
            return;
        };
        let nodes = shared.nodes_searched();
        let time_ms = self.tm.elapsed_time().max(1);
        let nps = nodes * 1000 / time_ms as u64;
        let tb_hits = shared.tb_hits_total();
        let hashfull = shared.tt.hashfull(0);

        for i in 0..multi_pv.min(self.root_moves.len()) {
            let rm = &self.root_moves[i];
            let updated = rm.score != -VALUE_INFINITE;
            if self.root_depth == 1 && !updated && i > 0 {
                continue;
            }
            let (depth, v) = if updated {
                (self.root_depth, rm.uci_score)
            } else {
                ((self.root_depth - 1).max(1), rm.previous_score)
            };
            if v == -VALUE_INFINITE {
                continue;
            }
            let bound = if rm.score_lowerbound {
                Some(Bound::Lower)
            } else if rm.score_upperbound {
                Some(Bound::Upper)
            } else {
                None
            };
            cb(&UpdateFullInfo {
                depth,
                sel_depth: rm.sel_depth,
                multipv: i + 1,
                score: Score::from_value(v),
                wdl: shared
                    .config
                    .show_wdl
                    .then(|| wdl_model(v, self.pos.material_count())),
                bound,
                nodes,
                nps,
                hashfull,
                tb_hits,
                time_ms,
                pv: pv_to_uci(&self.pos, &rm.pv),
            });
        }
    }

    // ------------------------------------------------------------------
    // The recursive alpha-beta search.
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn search(
        &mut self,
        shared: &SharedSearch,
        node: NodeType,
        mut alpha: Value,
        mut beta: Value,
        mut depth: Depth,
        cut_node: bool,
        ply: i32,
    ) -> Value {
        let pv_node = node != NodeType::NonPv;
        let root_node = node == NodeType::Root;

        if depth <= 0 {
            let qnode = if pv_node { NodeType::Pv } else { NodeType::NonPv };
            return self.qsearch(shared, qnode, alpha, beta, ply);
        }
        depth = depth.min(MAX_PLY as Depth - 1);

        self.maybe_check_time(shared);

        let idx = ply as usize + STACK_OFFSET;
        let us = self.pos.side_to_move();
        let in_check = self.pos.in_check();
        self.stack[idx].in_check = in_check;
        self.stack[idx].move_count = 0;
        self.stack[idx + 1].excluded = None;
        self.stack[idx + 1].cutoff_cnt = 0;
        if pv_node {
            self.stack[idx].pv.clear();
            self.sel_depth = self.sel_depth.max(ply + 1);
        }

        if !root_node {
            if self.pos.is_draw(ply as usize) {
                return value_draw(self.nodes);
            }
            if shared.stopped() || ply >= MAX_PLY as i32 - 1 {
                return if !in_check {
                    self.evaluate(shared)
                } else {
                    VALUE_DRAW
                };
            }
            // Mate distance pruning.
            alpha = alpha.max(mated_in(ply));
            beta = beta.min(mate_in(ply + 1));
            if alpha >= beta {
                return alpha;
            }
        }

        let excluded = self.stack[idx].excluded;

        // TT probe.
        let key = self.pos.key();
        let (tt_entry, tt_writer) = shared.tt.probe(key);
        let tt_data: Option<TTData> = tt_entry;
        let tt_value = tt_data.map_or(VALUE_NONE, |d| {
            value_from_tt(d.value, ply, self.pos.rule50_count())
        });
        let tt_move = if root_node {
            Some(self.root_moves[self.pv_idx].mv)
        } else {
            tt_data.and_then(|d| d.mv)
        };
        if excluded.is_none() {
            self.stack[idx].tt_pv = pv_node || tt_data.is_some_and(|d| d.is_pv);
        }
        let tt_capture = tt_move.is_some_and(|m| self.pos.is_capture_stage(m));

        // TT cutoff at non-PV nodes. Skipped near a 50-move draw where the
        // stored score may assume a different counter.
        if !pv_node && excluded.is_none() {
            if let Some(data) = tt_data {
                if data.depth > depth - i32::from(tt_value <= beta)
                    && tt_value != VALUE_NONE
                    && bound_matches(data.bound, tt_value, beta)
                    && self.pos.rule50_count() < 90
                {
                    if let Some(mv) = tt_move {
                        if tt_value >= beta && !self.pos.is_capture_stage(mv) {
                            let bonus = stat_bonus(depth);
                            self.update_quiet_histories(ply, mv, bonus);
                        }
                    }
                    return tt_value;
                }
            }
        }

        // Tablebase probe.
        let mut max_value = VALUE_INFINITE;
        let mut best_value = -VALUE_INFINITE;
        if !root_node && excluded.is_none() && shared.tb.max_cardinality() > 0 {
            let pieces = self.pos.piece_count();
            let cardinality = shared.tb.max_cardinality();
            if pieces <= cardinality
                && (pieces < cardinality || depth >= shared.config.tb.probe_depth)
                && self.pos.rule50_count() == 0
                && !self.pos.has_castling_rights()
            {
                if let Some(wdl) = shared.tb.probe_wdl(&self.pos) {
                    shared.tb_hits[self.thread_id].fetch_add(1, Ordering::Relaxed);
                    let value = wdl.to_value(ply as usize);
                    let bound = if is_win(value) {
                        Bound::Lower
                    } else if is_loss(value) {
                        Bound::Upper
                    } else {
                        Bound::Exact
                    };
                    if bound == Bound::Exact
                        || (bound == Bound::Lower && value >= beta)
                        || (bound == Bound::Upper && value <= alpha)
                    {
                        shared.tt.write(
                            tt_writer,
                            key,
                            value_to_tt(value, ply),
                            self.stack[idx].tt_pv,
                            bound,
                            (depth + 6).min(MAX_PLY as Depth - 1),
                            None,
                            VALUE_NONE,
                        );
                        return value;
                    }
                    if pv_node {
                        if bound == Bound::Lower {
                            best_value = value;
                            alpha = alpha.max(value);
                        } else {
                            max_value = value;
                        }
                    }
                }
            }
        }

        // Static evaluation.
        let correction = self.correction_value(ply);
        let mut unadjusted_eval = VALUE_NONE;
        let mut eval = VALUE_NONE;
        let mut improving = false;
        let mut opponent_worsening = false;

        if !in_check {
            if excluded.is_some() {
                unadjusted_eval = self.stack[idx].static_eval;
                eval = unadjusted_eval;
            } else if let Some(data) = tt_data {
                unadjusted_eval = if data.eval == VALUE_NONE {
                    self.evaluate(shared)
                } else {
                    data.eval
                };
                eval = crate::history::to_corrected_static_eval(unadjusted_eval, correction);
                self.stack[idx].static_eval = eval;
                // The stored search value is a better estimate when its
                // bound allows using it.
                if tt_value != VALUE_NONE && bound_matches(data.bound, tt_value, eval) {
                    eval = tt_value;
                }
            } else {
                unadjusted_eval = self.evaluate(shared);
                eval = crate::history::to_corrected_static_eval(unadjusted_eval, correction);
                self.stack[idx].static_eval = eval;
                shared.tt.write(
                    tt_writer,
                    key,
                    VALUE_NONE,
                    self.stack[idx].tt_pv,
                    Bound::None,
                    crate::types::DEPTH_UNSEARCHED,
                    None,
                    unadjusted_eval,
                );
            }

            let prev2 = self.stack[idx - 2].static_eval;
            improving = prev2 != VALUE_NONE && self.stack[idx].static_eval > prev2;
            let prev1 = self.stack[idx - 1].static_eval;
            opponent_worsening = prev1 != VALUE_NONE && self.stack[idx].static_eval > -prev1;

            // Re-expand or shrink the horizon based on how much the prior
            // move was reduced.
            if self.stack[idx - 1].reduction >= 3 && !opponent_worsening {
                depth += 1;
            }
            if self.stack[idx - 1].reduction >= 1 && depth >= 2 {
                depth -= 1;
            }
        } else {
            self.stack[idx].static_eval = VALUE_NONE;
        }

        if !in_check && excluded.is_none() {
            // Razoring.
            if !pv_node && eval < alpha - razor_margin(depth) {
                return self.qsearch(shared, NodeType::NonPv, alpha - 1, alpha, ply);
            }

            // Futility: static eval so far above beta that a reply is
            // unlikely to bring it back down.
            if !self.stack[idx].tt_pv
                && depth < FUTILITY_MAX_DEPTH
                && eval >= beta
                && eval
                    - futility_margin(depth, improving, opponent_worsening)
                    - self.stack[idx - 1].stat_score / FUTILITY_STAT_DIV
                    >= beta
                && (tt_move.is_none() || tt_capture)
                && !is_loss(beta)
                && !is_win(eval)
            {
                return beta + (eval - beta) / 3;
            }

            // Null move search.
            if cut_node
                && self.stack[idx - 1].current_move.is_some()
                && eval >= beta
                && self.stack[idx].static_eval >= beta - NULL_MOVE_EVAL_MARGIN * depth + 400
                && self.pos.has_non_pawn_material(us)
                && ply >= self.nmp_min_ply
                && !is_loss(beta)
            {
                let r = NULL_MOVE_BASE_REDUCTION
                    + depth / 3
                    + ((eval - beta) / NULL_MOVE_EVAL_DIV).min(6);
                self.stack[idx].current_move = None;
                self.stack[idx].cont_key = None;
                if self.pos.do_null_move() {
                    let value = -self.search(
                        shared,
                        NodeType::NonPv,
                        -beta,
                        -beta + 1,
                        depth - r,
                        false,
                        ply + 1,
                    );
                    self.pos.undo_null_move();
                    if value >= beta && !is_win(value) {
                        if self.nmp_min_ply != 0 || depth < NULL_MOVE_VERIFY_DEPTH {
                            return value;
                        }
                        // Verification search at the same depth, null
                        // moves disabled for a few plies.
                        self.nmp_min_ply = ply + 3 * (depth - r) / 4;
                        let v = self.search(
                            shared,
                            NodeType::NonPv,
                            beta - 1,
                            beta,
                            depth - r,
                            false,
                            ply,
                        );
                        self.nmp_min_ply = 0;
                        if v >= beta {
                            return value;
                        }
                    }
                }
            }

            // Internal iterative reduction.
            if (pv_node || cut_node) && depth >= IIR_MIN_DEPTH && tt_move.is_none() {
                depth -= 1;
            }

            // ProbCut: a good capture beating beta by a margin at reduced
            // depth is taken as proof of a fail-high.
            let probcut_beta = beta + PROBCUT_MARGIN - PROBCUT_IMPROVING * Value::from(improving);
            if !pv_node
                && depth > PROBCUT_MIN_DEPTH
                && !is_decisive(beta)
                && !tt_data.is_some_and(|d| d.depth >= depth - 3 && tt_value < probcut_beta)
            {
                let threshold = probcut_beta - self.stack[idx].static_eval;
                let mut picker =
                    MovePicker::new(&self.pos, tt_move, PickerKind::ProbCut { threshold });
                while let Some(mv) = picker.next(&self.pos) {
                    if Some(mv) == excluded {
                        continue;
                    }
                    let moved_piece = self.pos.moved_piece(mv);
                    self.do_move(shared, mv, ply, in_check);
                    self.stack[idx].cont_key = Some(ContinuationKey {
                        in_check,
                        capture: true,
                        piece: moved_piece,
                        to: mv.to,
                    });
                    let mut value = -self.qsearch(
                        shared,
                        NodeType::NonPv,
                        -probcut_beta,
                        -probcut_beta + 1,
                        ply + 1,
                    );
                    if value >= probcut_beta {
                        value = -self.search(
                            shared,
                            NodeType::NonPv,
                            -probcut_beta,
                            -probcut_beta + 1,
                            depth - PROBCUT_REDUCTION,
                            !cut_node,
                            ply + 1,
                        );
                    }
                    self.undo_move();
                    if shared.stopped() {
                        return VALUE_ZERO;
                    }
                    if value >= probcut_beta {
                        shared.tt.write(
                            tt_writer,
                            key,
                            value_to_tt(value, ply),
                            self.stack[idx].tt_pv,
                            Bound::Lower,
                            depth - 3,
                            Some(mv),
                            unadjusted_eval,
                        );
                        if !is_decisive(value) {
                            return value - (probcut_beta - beta);
                        }
                    }
                }
            }
        }

        // In-check probcut analogue from the TT.
        let probcut_beta_chk = beta + 417;
        if in_check
            && !pv_node
            && tt_capture
            && !is_decisive(beta)
            && tt_data.is_some_and(|d| {
                d.bound.admits_lower()
                    && d.depth >= depth - 4
                    && tt_value >= probcut_beta_chk
                    && !is_decisive(tt_value)
            })
        {
            return probcut_beta_chk;
        }

        // Moves loop.
        let cont_keys = self.cont_keys(ply);
        let mut picker = if in_check {
            MovePicker::new(
                &self.pos,
                tt_move,
                PickerKind::Evasions { histories: &self.histories, cont_keys: &cont_keys },
            )
        } else {
            MovePicker::new(
                &self.pos,
                tt_move,
                PickerKind::Main {
                    histories: &self.histories,
                    cont_keys: &cont_keys,
                    ply: ply as usize,
                    depth,
                },
            )
        };

        let mut best_move: Option<Move> = None;
        let mut move_count = 0;
        let mut value;
        let mut quiets_searched: Vec<Move> = Vec::new();
        let mut captures_searched: Vec<Move> = Vec::new();

        while let Some(mv) = picker.next(&self.pos) {
            if Some(mv) == excluded {
                continue;
            }
            if root_node
                && !self.root_moves[self.pv_idx..self.pv_last]
                    .iter()
                    .any(|rm| rm.mv == mv)
            {
                continue;
            }
            move_count += 1;
            self.stack[idx].move_count = move_count;

            if root_node && self.is_main() && shared.nodes_searched() > 10_000_000 {
                if let Some(cb) = &shared.callbacks.on_iter {
                    cb(&IterInfo {
                        depth,
                        currmove: self.pos.move_to_uci(mv),
                        currmovenumber: move_count as usize + self.pv_idx,
                    });
                }
            }

            let capture = self.pos.is_capture_stage(mv);
            let moved_piece = self.pos.moved_piece(mv);
            let gives_check = self.pos.gives_check(mv);
            let delta = beta - alpha;
            let mut r = self.reduction(improving, depth, move_count, delta);

            // Shallow-depth pruning.
            if !root_node && self.pos.has_non_pawn_material(us) && !is_loss(best_value) {
                if move_count >= lmp_threshold(depth, improving) {
                    picker.skip_quiet_moves();
                }
                let mut lmr_depth = depth - 1 - r / 1024;

                if capture || gives_check {
                    let captured = self.pos.captured_piece(mv).unwrap_or(Piece::Queen);
                    let capt_hist = self.histories.capture.get(moved_piece, mv.to, captured);
                    if !gives_check && !in_check && lmr_depth < 7 {
                        let futility = self.stack[idx].static_eval
                            + CAPTURE_FUTILITY_BASE
                            + CAPTURE_FUTILITY_MULT * lmr_depth
                            + self.pos.capture_value(mv)
                            + capt_hist / CAPTURE_HIST_DIV;
                        if futility <= alpha {
                            continue;
                        }
                    }
                    if !self
                        .pos
                        .see_ge(mv, -CAPTURE_SEE_MULT * depth - capt_hist / 32)
                    {
                        continue;
                    }
                } else if !in_check {
                    let mut history = self.cont_hist_sum(ply, moved_piece, mv.to, 2)
                        + self.histories.pawn.get(self.pos.pawn_key(), moved_piece, mv.to);
                    if history < QUIET_CONT_HIST_BASE * depth {
                        continue;
                    }
                    history += 2 * self.histories.butterfly.get(us, mv);
                    lmr_depth += history / 3609;

                    let futility_value = self.stack[idx].static_eval
                        + QUIET_FUTILITY_BASE
                        + QUIET_FUTILITY_MULT * lmr_depth;
                    if lmr_depth < 12 && futility_value <= alpha {
                        if !is_decisive(futility_value) {
                            best_value = best_value.max(futility_value);
                        }
                        continue;
                    }
                    let lmr_depth = lmr_depth.max(0);
                    if !self
                        .pos
                        .see_ge(mv, -QUIET_SEE_MULT * lmr_depth * lmr_depth)
                    {
                        continue;
                    }
                }
            }

            // Singular extension: verify the TT move is the only good one
            // by searching everything else at a lower bound.
            let mut extension: Depth = 0;
            if !root_node
                && ply < 2 * self.root_depth
                && depth >= SINGULAR_MIN_DEPTH
                && Some(mv) == tt_move
                && excluded.is_none()
            {
                if let Some(data) = tt_data {
                    if data.depth >= depth - 3
                        && data.bound.admits_lower()
                        && !is_decisive(tt_value)
                        && tt_value != VALUE_NONE
                    {
                        let singular_beta = tt_value
                            - (56 + 79 * Value::from(self.stack[idx].tt_pv && !pv_node)) * depth
                                / 64
                                * SINGULAR_MARGIN_MULT;
                        let singular_depth = (depth - 1) / 2;
                        self.stack[idx].excluded = Some(mv);
                        let v = self.search(
                            shared,
                            NodeType::NonPv,
                            singular_beta - 1,
                            singular_beta,
                            singular_depth,
                            cut_node,
                            ply,
                        );
                        self.stack[idx].excluded = None;

                        if v < singular_beta {
                            extension = 1;
                            if !pv_node && v < singular_beta - SINGULAR_DOUBLE_MARGIN {
                                extension = 2
                                    + Depth::from(
                                        !tt_capture && v < singular_beta - SINGULAR_TRIPLE_MARGIN,
                                    );
                            }
                        } else if v >= beta && !is_decisive(v) {
                            // Multi-cut: even without the TT move this node
                            // fails high.
                            return v;
                        } else if tt_value >= beta {
                            extension = -3;
                        } else if cut_node {
                            extension = -2;
                        }
                    }
                }
            }

            let new_depth = depth - 1 + extension;
            let nodes_before = self.nodes;

            self.stack[idx].stat_score = if capture {
                0
            } else {
                2 * self.histories.butterfly.get(us, mv)
                    + self.cont_hist_sum(ply, moved_piece, mv.to, 2)
                    - 3996
            };

            // Reduction adjustments on top of the table value.
            if self.stack[idx].tt_pv {
                r -= LMR_TT_PV
                    + i32::from(tt_value > alpha) * 1024
                    + i32::from(tt_data.is_some_and(|d| d.depth >= depth)) * 1024;
            }
            if pv_node {
                r -= 1024;
            }
            if cut_node {
                r += LMR_CUT_NODE;
            }
            if tt_capture && !capture {
                r += LMR_TT_CAPTURE;
            }
            if self.stack[idx + 1].cutoff_cnt > 2 {
                r += LMR_CUTOFF_CNT;
            }
            r += self.stack[idx].quiet_move_streak * 51;
            r -= self.stack[idx].stat_score * 1024 / (LMR_STAT_DIV * 1024);

            self.do_move(shared, mv, ply, in_check);
            self.stack[idx].cont_key = Some(ContinuationKey {
                in_check,
                capture,
                piece: moved_piece,
                to: mv.to,
            });
            self.stack[idx + 1].quiet_move_streak = if capture || gives_check {
                0
            } else {
                self.stack[idx].quiet_move_streak + 1
            };

            // Late-move reductions with a verification re-search.
            if depth >= 2 && move_count > 1 {
                let d = (new_depth - r / 1024).clamp(1, new_depth + 2) + Depth::from(pv_node) - 1;
                let d = d.max(1);
                self.stack[idx].reduction = new_depth - d;
                value = -self.search(shared, NodeType::NonPv, -(alpha + 1), -alpha, d, true, ply + 1);
                self.stack[idx].reduction = 0;

                if value > alpha && d < new_depth {
                    let deeper =
                        value > best_value + LMR_DEEPER_BASE + LMR_DEEPER_DEPTH_MULT * new_depth;
                    let shallower = value < best_value + 9;
                    let full = new_depth + Depth::from(deeper) - Depth::from(shallower);
                    if full > d {
                        value = -self.search(
                            shared,
                            NodeType::NonPv,
                            -(alpha + 1),
                            -alpha,
                            full,
                            !cut_node,
                            ply + 1,
                        );
                    }
                    if value >= beta && !capture {
                        self.update_continuation_histories(
                            ply + 1,
                            moved_piece,
                            mv.to,
                            stat_bonus(new_depth),
                        );
                    }
                }
            } else if !pv_node || move_count > 1 {
                let mut d = new_depth;
                if tt_move.is_none() && cut_node {
                    r += 1156;
                }
                d -= Depth::from(r > 3495) + Depth::from(r > 5510 && new_depth > 2);
                value = -self.search(
                    shared,
                    NodeType::NonPv,
                    -(alpha + 1),
                    -alpha,
                    d,
                    !cut_node,
                    ply + 1,
                );
            } else {
                value = alpha; // placeholder, PV search below always runs
            }

            if pv_node && (move_count == 1 || value > alpha) {
                self.stack[idx + 1].pv.clear();
                value = -self.search(shared, NodeType::Pv, -beta, -alpha, new_depth, false, ply + 1);
            }

            self.undo_move();

            if shared.stopped() {
                return VALUE_ZERO;
            }

            if root_node {
                let sel_depth = self.sel_depth;
                let nodes_spent = self.nodes - nodes_before;
                let child_pv = self.stack[idx + 1].pv.clone();
                let mut changed = false;
                if let Some(rm) = self.root_moves.iter_mut().find(|rm| rm.mv == mv) {
                    rm.effort += nodes_spent;
                    rm.average_score = if rm.average_score == -VALUE_INFINITE {
                        value
                    } else {
                        (2 * value + rm.average_score) / 3
                    };
                    rm.mean_squared_score = if rm.mean_squared_score
                        == -(i64::from(VALUE_INFINITE) * i64::from(VALUE_INFINITE))
                    {
                        i64::from(value) * i64::from(value.abs())
                    } else {
                        (i64::from(value) * i64::from(value.abs()) + rm.mean_squared_score) / 2
                    };

                    if move_count == 1 || value > alpha {
                        rm.score = value;
                        rm.uci_score = value;
                        rm.sel_depth = sel_depth;
                        rm.score_lowerbound = false;
                        rm.score_upperbound = false;
                        if value >= beta {
                            rm.score_lowerbound = true;
                            rm.uci_score = beta;
                        } else if value <= alpha {
                            rm.score_upperbound = true;
                            rm.uci_score = alpha;
                        }
                        rm.pv.clear();
                        rm.pv.push(mv);
                        rm.pv.extend(child_pv);
                        changed = move_count > 1;
                    } else {
                        // Keep sorting stable: unsearched moves sink.
                        rm.score = -VALUE_INFINITE;
                    }
                }
                if changed && self.pv_idx == 0 {
                    shared.best_move_changes[self.thread_id].fetch_add(1, Ordering::Relaxed);
                }
            }

            if value > best_value {
                best_value = value;
                if value > alpha {
                    best_move = Some(mv);
                    if pv_node && !root_node {
                        self.update_pv(idx, mv);
                    }
                    if value >= beta {
                        self.stack[idx].cutoff_cnt += 1 + i32::from(extension < 2);
                        break;
                    }
                    alpha = value;
                }
            }

            if Some(mv) != best_move && move_count <= 32 {
                if capture {
                    captures_searched.push(mv);
                } else {
                    quiets_searched.push(mv);
                }
            }
        }

        // Checkmate, stalemate, or an excluded-move subsearch that found
        // nothing better than the window floor.
        if move_count == 0 {
            best_value = if excluded.is_some() {
                alpha
            } else if in_check {
                mated_in(ply)
            } else {
                VALUE_DRAW
            };
        } else if let Some(best) = best_move {
            self.update_all_stats(ply, depth, best, &quiets_searched, &captures_searched);
        } else if let Some(prev_key) = self.stack[idx - 1].cont_key {
            // Fail low: credit the opponent move that kept us down.
            if !prev_key.capture {
                let bonus = stat_bonus(depth) / 2;
                self.update_continuation_histories(ply - 1, prev_key.piece, prev_key.to, bonus);
                self.histories.pawn.update(
                    self.pos.pawn_key(),
                    prev_key.piece,
                    prev_key.to,
                    bonus / 2,
                );
            }
        }

        if pv_node {
            best_value = best_value.min(max_value);
        }
        if best_value <= alpha {
            self.stack[idx].tt_pv =
                self.stack[idx].tt_pv || (self.stack[idx - 1].tt_pv && depth > 3);
        }

        // Correction history: track how far the search outran the static
        // eval in quiet positions.
        if !in_check
            && !best_move.is_some_and(|m| self.pos.is_capture_stage(m))
            && !(best_value >= beta && best_value <= self.stack[idx].static_eval)
            && !(best_move.is_none() && best_value >= self.stack[idx].static_eval)
            && self.stack[idx].static_eval != VALUE_NONE
        {
            let bonus = ((best_value - self.stack[idx].static_eval) * depth / 8)
                .clamp(-CORRECTION_LIMIT / 4, CORRECTION_LIMIT / 4);
            self.histories
                .pawn_correction
                .update(us, self.pos.pawn_key(), bonus);
            self.histories
                .minor_correction
                .update(us, self.pos.minor_piece_key(), bonus);
            self.histories.non_pawn_correction[Color::White as usize].update(
                us,
                self.pos.non_pawn_key(Color::White),
                bonus,
            );
            self.histories.non_pawn_correction[Color::Black as usize].update(
                us,
                self.pos.non_pawn_key(Color::Black),
                bonus,
            );
            if let (Some(k2), Some(k1)) =
                (self.stack[idx - 2].cont_key, self.stack[idx - 1].cont_key)
            {
                self.histories
                    .continuation_correction
                    .update(&k2, k1.piece, k1.to, bonus);
            }
        }

        // TT store. Secondary multi-PV lines stay out of the table so the
        // primary line's entries survive.
        if excluded.is_none() && !(root_node && self.pv_idx > 0) {
            let bound = if best_value >= beta {
                Bound::Lower
            } else if pv_node && best_move.is_some() {
                Bound::Exact
            } else {
                Bound::Upper
            };
            let store_depth = if move_count != 0 {
                depth
            } else {
                (depth + 6).min(MAX_PLY as Depth - 1)
            };
            shared.tt.write(
                tt_writer,
                key,
                value_to_tt(best_value, ply),
                self.stack[idx].tt_pv,
                bound,
                store_depth,
                best_move,
                unadjusted_eval,
            );
        }

        best_value
    }

    // ------------------------------------------------------------------
    // Quiescence search.
    // ------------------------------------------------------------------

    fn qsearch(
        &mut self,
        shared: &SharedSearch,
        node: NodeType,
        mut alpha: Value,
        beta: Value,
        ply: i32,
    ) -> Value {
        let pv_node = node == NodeType::Pv;
        let idx = ply as usize + STACK_OFFSET;

        if pv_node {
            self.stack[idx].pv.clear();
            self.sel_depth = self.sel_depth.max(ply + 1);
        }

        if self.pos.is_draw(ply as usize) {
            return value_draw(self.nodes);
        }
        let in_check = self.pos.in_check();
        self.stack[idx].in_check = in_check;
        if ply >= MAX_PLY as i32 - 1 {
            return if !in_check { self.evaluate(shared) } else { VALUE_DRAW };
        }

        let key = self.pos.key();
        let (tt_data, tt_writer) = shared.tt.probe(key);
        let tt_value = tt_data.map_or(VALUE_NONE, |d| {
            value_from_tt(d.value, ply, self.pos.rule50_count())
        });
        let tt_move = tt_data.and_then(|d| d.mv);
        let pv_hit = tt_data.is_some_and(|d| d.is_pv);

        if !pv_node {
            if let Some(data) = tt_data {
                if data.depth >= crate::types::DEPTH_QS
                    && tt_value != VALUE_NONE
                    && bound_matches(data.bound, tt_value, beta)
                {
                    return tt_value;
                }
            }
        }

        let mut best_value;
        let mut unadjusted_eval = VALUE_NONE;
        let mut futility_base = -VALUE_INFINITE;

        if in_check {
            best_value = -VALUE_INFINITE;
        } else {
            let correction = self.correction_value(ply);
            unadjusted_eval = match tt_data {
                Some(d) if d.eval != VALUE_NONE => d.eval,
                _ => self.evaluate(shared),
            };
            best_value = crate::history::to_corrected_static_eval(unadjusted_eval, correction);
            self.stack[idx].static_eval = best_value;
            if let Some(data) = tt_data {
                if tt_value != VALUE_NONE && bound_matches(data.bound, tt_value, best_value) {
                    best_value = tt_value;
                }
            }

            // Stand pat.
            if best_value >= beta {
                if tt_data.is_none() {
                    shared.tt.write(
                        tt_writer,
                        key,
                        value_to_tt(best_value, ply),
                        false,
                        Bound::Lower,
                        crate::types::DEPTH_UNSEARCHED,
                        None,
                        unadjusted_eval,
                    );
                }
                return if is_decisive(best_value) {
                    best_value
                } else {
                    (best_value + beta) / 2
                };
            }
            alpha = alpha.max(best_value);
            futility_base = best_value + QS_FUTILITY_MARGIN;
        }

        let cont_keys = self.cont_keys(ply);
        let mut picker = if in_check {
            MovePicker::new(
                &self.pos,
                tt_move,
                PickerKind::Evasions { histories: &self.histories, cont_keys: &cont_keys },
            )
        } else {
            MovePicker::new(&self.pos, tt_move, PickerKind::QSearch { histories: &self.histories })
        };

        let mut best_move: Option<Move> = None;
        let mut move_count = 0;

        while let Some(mv) = picker.next(&self.pos) {
            move_count += 1;
            let capture = self.pos.is_capture_stage(mv);
            let gives_check = self.pos.gives_check(mv);
            let moved_piece = self.pos.moved_piece(mv);

            if !is_loss(best_value) {
                // Futility on quiet-ish captures.
                if !in_check && !gives_check && futility_base > -VALUE_INFINITE {
                    let futility_value = futility_base + self.pos.capture_value(mv);
                    if futility_value <= alpha {
                        best_value = best_value.max(futility_value);
                        continue;
                    }
                    if futility_base <= alpha && !self.pos.see_ge(mv, 1) {
                        best_value = best_value.max(futility_base);
                        continue;
                    }
                }
                // Quiet evasions with hopeless history are not worth a
                // node.
                if in_check && !capture && move_count > 1 {
                    let history = self.cont_hist_sum(ply, moved_piece, mv.to, 1)
                        + self.histories.pawn.get(self.pos.pawn_key(), moved_piece, mv.to);
                    if history <= 5228 && best_value > VALUE_TB_LOSS_IN_MAX_PLY {
                        continue;
                    }
                }
                if !self.pos.see_ge(mv, -74) {
                    continue;
                }
            }

            self.do_move(shared, mv, ply, in_check);
            self.stack[idx].cont_key = Some(ContinuationKey {
                in_check,
                capture,
                piece: moved_piece,
                to: mv.to,
            });
            let value = -self.qsearch(shared, node, -beta, -alpha, ply + 1);
            self.undo_move();

            if shared.stopped() {
                return VALUE_ZERO;
            }

            if value > best_value {
                best_value = value;
                if value > alpha {
                    best_move = Some(mv);
                    if pv_node {
                        self.update_pv(idx, mv);
                    }
                    if value >= beta {
                        break;
                    }
                    alpha = value;
                }
            }
        }

        if in_check && best_value == -VALUE_INFINITE {
            return mated_in(ply);
        }

        // The capture-only horizon can miss a stalemate; check before
        // standing on a fail-low score.
        if !in_check && move_count == 0 && best_value <= alpha && !self.pos.has_legal_moves() {
            return VALUE_DRAW;
        }

        if !is_decisive(best_value) && best_value > beta {
            best_value = (best_value + beta) / 2;
        }

        let bound = if best_value >= beta { Bound::Lower } else { Bound::Upper };
        shared.tt.write(
            tt_writer,
            key,
            value_to_tt(best_value, ply),
            pv_hit,
            bound,
            crate::types::DEPTH_QS,
            best_move,
            unadjusted_eval,
        );
        best_value
    }

    // ------------------------------------------------------------------
    // Helpers.
    // ------------------------------------------------------------------

    fn evaluate(&self, shared: &SharedSearch) -> Value {
        nnue::evaluate(
            &shared.networks,
            &self.pos,
            &self.accumulators,
            self.optimism[self.pos.side_to_move() as usize],
        )
    }

    fn do_move(&mut self, shared: &SharedSearch, mv: Move, ply: i32, _in_check: bool) {
        let idx = ply as usize + STACK_OFFSET;
        self.stack[idx].current_move = Some(mv);
        let dirty = self.pos.do_move(mv);
        self.nodes += 1;
        shared.nodes[self.thread_id].fetch_add(1, Ordering::Relaxed);
        self.accumulators
            .push(&self.pos, &dirty, &shared.networks, &mut self.refresh);
    }

    fn undo_move(&mut self) {
        self.pos.undo_move();
        self.accumulators.pop();
    }

    fn update_pv(&mut self, idx: usize, mv: Move) {
        let child = std::mem::take(&mut self.stack[idx + 1].pv);
        let pv = &mut self.stack[idx].pv;
        pv.clear();
        pv.push(mv);
        pv.extend_from_slice(&child);
        self.stack[idx + 1].pv = child;
    }

    /// Continuation keys of the last `CONT_HIST_PLIES` plies, oldest first.
    fn cont_keys(&self, ply: i32) -> [Option<ContinuationKey>; CONT_HIST_PLIES] {
        let idx = ply as usize + STACK_OFFSET;
        let mut keys = [None; CONT_HIST_PLIES];
        for (i, slot) in keys.iter_mut().enumerate() {
            *slot = self.stack[idx - CONT_HIST_PLIES + i].cont_key;
        }
        keys
    }

    /// Sum of the first `plies` continuation-history slices for a move.
    fn cont_hist_sum(&self, ply: i32, piece: Piece, to: cozy_chess::Square, plies: usize) -> i32 {
        let idx = ply as usize + STACK_OFFSET;
        let mut sum = 0;
        for back in 1..=plies {
            if let Some(key) = self.stack[idx - back].cont_key {
                sum += self.histories.continuation.get(&key, piece, to);
            }
        }
        sum
    }

    fn update_continuation_histories(
        &mut self,
        ply: i32,
        piece: Piece,
        to: cozy_chess::Square,
        bonus: i32,
    ) {
        let idx = ply as usize + STACK_OFFSET;
        // Deeper plies contribute less; stop early once a check truncated
        // the continuation.
        for (back, weight) in [(1usize, 1024), (2, 640), (3, 320), (4, 512), (6, 128)] {
            if self.stack[idx].in_check && back > 2 {
                break;
            }
            if idx < back {
                break;
            }
            if let Some(key) = self.stack[idx - back].cont_key {
                self.histories
                    .continuation
                    .update(&key, piece, to, bonus * weight / 1024);
            }
        }
    }

    fn update_quiet_histories(&mut self, ply: i32, mv: Move, bonus: i32) {
        let us = self.pos.side_to_move();
        let piece = self.pos.moved_piece(mv);
        self.histories.butterfly.update(us, mv, bonus);
        if (ply as usize) < LOW_PLY_SIZE {
            self.histories
                .low_ply
                .update(ply as usize, mv, bonus * 8 / (1 + 2 * ply));
        }
        self.histories
            .pawn
            .update(self.pos.pawn_key(), piece, mv.to, bonus);
        self.update_continuation_histories(ply, piece, mv.to, bonus);
    }

    fn update_all_stats(
        &mut self,
        ply: i32,
        depth: Depth,
        best: Move,
        quiets: &[Move],
        captures: &[Move],
    ) {
        let bonus = stat_bonus(depth);
        let malus = stat_malus(depth);

        if self.pos.is_capture_stage(best) {
            let moved = self.pos.moved_piece(best);
            let captured = self.pos.captured_piece(best).unwrap_or(Piece::Queen);
            self.histories.capture.update(moved, best.to, captured, bonus);
        } else {
            self.update_quiet_histories(ply, best, bonus);
            for &q in quiets {
                let piece = self.pos.moved_piece(q);
                self.histories
                    .butterfly
                    .update(self.pos.side_to_move(), q, -malus);
                self.histories
                    .pawn
                    .update(self.pos.pawn_key(), piece, q.to, -malus);
                self.update_continuation_histories(ply, piece, q.to, -malus);
            }
        }
        for &c in captures {
            let moved = self.pos.moved_piece(c);
            let captured = self.pos.captured_piece(c).unwrap_or(Piece::Queen);
            self.histories.capture.update(moved, c.to, captured, -malus);
        }
    }

    /// Weighted correction-history sum for the current position.
    fn correction_value(&self, ply: i32) -> i32 {
        let idx = ply as usize + STACK_OFFSET;
        let us = self.pos.side_to_move();
        let pcv = self.histories.pawn_correction.get(us, self.pos.pawn_key());
        let micv = self
            .histories
            .minor_correction
            .get(us, self.pos.minor_piece_key());
        let wnpcv = self.histories.non_pawn_correction[Color::White as usize]
            .get(us, self.pos.non_pawn_key(Color::White));
        let bnpcv = self.histories.non_pawn_correction[Color::Black as usize]
            .get(us, self.pos.non_pawn_key(Color::Black));
        let cntcv = match (self.stack[idx - 2].cont_key, self.stack[idx - 1].cont_key) {
            (Some(k2), Some(k1)) => self
                .histories
                .continuation_correction
                .get(&k2, k1.piece, k1.to),
            _ => 0,
        };
        CORR_PAWN_WEIGHT * pcv
            + CORR_MINOR_WEIGHT * micv
            + CORR_NON_PAWN_WEIGHT * (wnpcv + bnpcv)
            + CORR_CONT_WEIGHT * cntcv
    }

    fn reduction(&self, improving: bool, depth: Depth, move_count: i32, delta: Value) -> i32 {
        let d = REDUCTIONS[(depth as usize).min(MAX_MOVES - 1)];
        let m = REDUCTIONS[(move_count as usize).min(MAX_MOVES - 1)];
        let scale = d * m;
        scale - delta * LMR_DELTA_MULT / self.root_delta.max(1)
            + i32::from(!improving) * scale * LMR_NON_IMPROVING / 4096
            + LMR_BASE
    }

    /// Main thread: poll the clock and the hard limits every few hundred
    /// nodes.
    fn maybe_check_time(&mut self, shared: &SharedSearch) {
        self.calls_cnt -= 1;
        if self.calls_cnt > 0 {
            return;
        }
        self.calls_cnt = match shared.limits.nodes {
            Some(n) => (n / 1024).clamp(32, 512) as i32,
            None => 512,
        };
        if !self.is_main() || self.completed_depth == 0 {
            return;
        }
        if shared.ponder.load(Ordering::Relaxed) {
            return;
        }

        let mut out_of_budget = false;
        if shared.limits.use_time_management() {
            let elapsed = self.tm.elapsed(|| shared.nodes_searched());
            out_of_budget = elapsed >= self.tm.maximum();
        }
        if let Some(movetime) = shared.limits.movetime {
            out_of_budget |= self.tm.elapsed_time() >= movetime;
        }
        if let Some(nodes) = shared.limits.nodes {
            out_of_budget |= shared.nodes_searched() >= nodes;
        }
        if out_of_budget && !shared.limits.infinite {
            shared.stop.store(true, Ordering::Relaxed);
        }
    }
}

fn bound_matches(bound: Bound, value: Value, threshold: Value) -> bool {
    if value >= threshold {
        bound.admits_lower()
    } else {
        bound.admits_upper()
    }
}

/// Render a PV as a space-separated UCI move list.
#[must_use]
pub fn pv_to_uci(root: &Position, pv: &[Move]) -> String {
    let mut pos = root.clone();
    let mut out = Vec::with_capacity(pv.len());
    for &mv in pv {
        if !pos.is_legal(mv) {
            break;
        }
        out.push(pos.move_to_uci(mv));
        pos.do_move(mv);
    }
    out.join(" ")
}

/// Node-counting walk of the move tree, used by `go perft`.
#[must_use]
pub fn perft(pos: &mut Position, depth: Depth) -> u64 {
    if depth == 0 {
        return 1;
    }
    let moves = pos.legal_moves();
    if depth == 1 {
        return moves.len() as u64;
    }
    let mut count = 0;
    for mv in moves {
        pos.do_move(mv);
        count += perft(pos, depth - 1);
        pos.undo_move();
    }
    count
}

// ----------------------------------------------------------------------
// Skill handicap: at low levels the engine picks a plausibly-human move
// instead of the best one.
// ----------------------------------------------------------------------

struct Skill {
    level: f64,
    best: Option<Move>,
}

impl Skill {
    fn new(level: i32) -> Self {
        Skill {
            level: f64::from(level),
            best: None,
        }
    }

    fn enabled(&self) -> bool {
        self.level < 20.0
    }

    fn time_to_pick(&self, depth: Depth) -> bool {
        depth == 1 + self.level as Depth
    }

    /// Weighted-random choice among the multi-PV candidates: weaker levels
    /// wander further from the top score.
    fn pick_best(&mut self, root_moves: &[RootMove], multi_pv: usize, rng: &mut SmallRng) {
        let multi_pv = multi_pv.min(root_moves.len());
        let top_score = root_moves[0].score;
        let delta = (top_score - root_moves[multi_pv - 1].score).min(PAWN_VALUE);
        let weakness = 120.0 - 2.0 * self.level;

        let mut best_value = -VALUE_INFINITE;
        self.best = Some(root_moves[0].mv);
        for rm in &root_moves[..multi_pv] {
            let push = (weakness * f64::from(top_score - rm.score)
                + f64::from(delta) * rng.gen_range(0.0..weakness))
                / 128.0;
            if rm.score + push as Value >= best_value {
                best_value = rm.score + push as Value;
                self.best = Some(rm.mv);
            }
        }
    }
}
