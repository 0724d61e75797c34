//! Worker thread pool.
//!
//! Threads are spawned once and parked between searches so history tables
//! survive from move to move. A search is dispatched by depositing a job
//! in every thread's slot; the main worker (thread 0) additionally waits
//! out ponder mode, joins the helpers, runs the best-thread vote and
//! emits `bestmove`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use cozy_chess::Move;
use log::{info, warn};
use parking_lot::{Condvar, Mutex};

use crate::position::Position;
use crate::search::{BestMoveInfo, SharedSearch, ThreadResult, Worker};
use crate::types::{is_loss, is_win};

enum Job {
    Search(Arc<SharedSearch>, Position),
    Clear,
}

struct SlotState {
    job: Option<Job>,
    busy: bool,
    quit: bool,
}

struct JobSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl JobSlot {
    fn new() -> Self {
        JobSlot {
            state: Mutex::new(SlotState { job: None, busy: false, quit: false }),
            cond: Condvar::new(),
        }
    }

    fn deposit(&self, job: Job) {
        let mut st = self.state.lock();
        st.job = Some(job);
        st.busy = true;
        self.cond.notify_all();
    }

    fn wait_idle(&self) {
        let mut st = self.state.lock();
        while st.busy {
            self.cond.wait(&mut st);
        }
    }

    fn finish(&self) {
        let mut st = self.state.lock();
        st.busy = false;
        self.cond.notify_all();
    }
}

pub struct ThreadPool {
    slots: Arc<Vec<Arc<JobSlot>>>,
    handles: Vec<JoinHandle<()>>,
    active: Mutex<Option<Arc<SharedSearch>>>,
}

impl ThreadPool {
    #[must_use]
    pub fn new(count: usize) -> Self {
        let mut pool = ThreadPool {
            slots: Arc::new(Vec::new()),
            handles: Vec::new(),
            active: Mutex::new(None),
        };
        pool.set(count);
        pool
    }

    /// Resize the pool. Waits for the running search, then tears every
    /// thread down and respawns, losing the history tables.
    pub fn set(&mut self, count: usize) {
        let count = count.max(1);
        self.wait_for_search_finished();
        self.shutdown();

        let slots: Vec<Arc<JobSlot>> = (0..count).map(|_| Arc::new(JobSlot::new())).collect();
        self.slots = Arc::new(slots);
        self.handles = (0..count)
            .map(|id| {
                let slot = Arc::clone(&self.slots[id]);
                let all_slots = Arc::clone(&self.slots);
                std::thread::Builder::new()
                    .name(format!("search-{id}"))
                    .stack_size(8 * 1024 * 1024)
                    .spawn(move || thread_loop(id, &slot, &all_slots))
                    .unwrap_or_else(|e| panic!("failed to spawn search thread: {e}"))
            })
            .collect();
        info!("thread pool sized to {count}");
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Kick off a search on every thread. Returns immediately.
    pub fn start_thinking(&self, shared: Arc<SharedSearch>, root: &Position) {
        self.wait_for_search_finished();
        *self.active.lock() = Some(Arc::clone(&shared));
        // Helpers get their jobs first: the main worker joins them after
        // its own deepening loop and must not race past an empty slot.
        for slot in self.slots.iter().skip(1) {
            slot.deposit(Job::Search(Arc::clone(&shared), root.clone()));
        }
        self.slots[0].deposit(Job::Search(shared, root.clone()));
    }

    /// Signal the running search to stop at the next node boundary.
    pub fn stop(&self) {
        if let Some(shared) = self.active.lock().as_ref() {
            shared.stop.store(true, Ordering::Relaxed);
        }
    }

    /// The ponder move was played: convert the ponder search into a
    /// normal one, stopping right away if its time already ran out.
    pub fn ponderhit(&self) {
        if let Some(shared) = self.active.lock().as_ref() {
            shared.ponder.store(false, Ordering::Relaxed);
            if shared.stop_on_ponderhit.load(Ordering::Relaxed) {
                shared.stop.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Block until every thread is parked again.
    pub fn wait_for_search_finished(&self) {
        for slot in self.slots.iter() {
            slot.wait_idle();
        }
    }

    #[must_use]
    pub fn is_searching(&self) -> bool {
        self.slots.iter().any(|slot| slot.state.lock().busy)
    }

    /// Reset the history tables on every thread, as for `ucinewgame`.
    pub fn clear(&self) {
        self.wait_for_search_finished();
        for slot in self.slots.iter() {
            slot.deposit(Job::Clear);
        }
        self.wait_for_search_finished();
    }

    fn shutdown(&mut self) {
        for slot in self.slots.iter() {
            let mut st = slot.state.lock();
            st.quit = true;
            slot.cond.notify_all();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("search thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
        self.wait_for_search_finished();
        self.shutdown();
    }
}

fn thread_loop(id: usize, slot: &JobSlot, all_slots: &[Arc<JobSlot>]) {
    let mut worker = Worker::new(id);
    loop {
        let job = {
            let mut st = slot.state.lock();
            loop {
                if let Some(job) = st.job.take() {
                    break job;
                }
                if st.quit {
                    return;
                }
                slot.cond.wait(&mut st);
            }
        };
        match job {
            Job::Search(shared, root) => {
                worker.start_search(&shared, root.clone());
                if id == 0 {
                    main_thread_epilogue(&shared, &root, all_slots);
                }
            }
            Job::Clear => worker.clear(),
        }
        slot.finish();
    }
}

/// Runs on thread 0 after its deepening loop: honor ponder/infinite,
/// join the helpers, vote, and announce the best move.
fn main_thread_epilogue(shared: &SharedSearch, root: &Position, slots: &[Arc<JobSlot>]) {
    // In ponder or infinite mode the protocol forbids printing bestmove
    // until the GUI releases us.
    while !shared.stopped()
        && (shared.ponder.load(Ordering::Relaxed) || shared.limits.infinite)
    {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    shared.stop.store(true, Ordering::Relaxed);
    for slot in slots.iter().skip(1) {
        slot.wait_idle();
    }

    let results: Vec<ThreadResult> = shared
        .results
        .iter()
        .map(|slot| slot.lock().clone())
        .collect();
    let best = select_best_thread(&results);

    let info = match results[best].root_moves.first() {
        Some(rm) if !rm.pv.is_empty() => {
            let bestmove = root.move_to_uci(rm.pv[0]);
            let ponder = rm.pv.get(1).map(|&m| {
                let mut after = root.clone();
                after.do_move(rm.pv[0]);
                after.move_to_uci(m)
            });
            BestMoveInfo { bestmove, ponder }
        }
        _ => BestMoveInfo { bestmove: "(none)".to_string(), ponder: None },
    };
    if let Some(cb) = &shared.callbacks.on_bestmove {
        cb(&info);
    }
}

/// Pick the thread whose result the engine should trust. Each thread
/// casts a vote for its best move weighted by score margin and completed
/// depth; decisive scores override the ballot.
#[must_use]
pub fn select_best_thread(results: &[ThreadResult]) -> usize {
    let live: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.root_moves.is_empty())
        .map(|(i, _)| i)
        .collect();
    let Some(&first) = live.first() else {
        return 0;
    };
    if live.len() == 1 {
        return first;
    }

    let score_of = |i: usize| results[i].root_moves[0].score;
    let move_of = |i: usize| results[i].root_moves[0].mv;
    let depth_of = |i: usize| results[i].completed_depth;

    let min_score = live.iter().map(|&i| score_of(i)).min().unwrap_or(0);
    let mut votes: HashMap<Move, i64> = HashMap::new();
    for &i in &live {
        *votes.entry(move_of(i)).or_insert(0) +=
            i64::from(score_of(i) - min_score + 14) * i64::from(depth_of(i));
    }

    let mut best = first;
    for &i in &live[1..] {
        let (bs, ns) = (score_of(best), score_of(i));
        let better = if is_win(bs) {
            // Among proven wins, take the shortest mate.
            ns > bs
        } else if is_win(ns) {
            true
        } else if is_loss(bs) {
            !is_loss(ns) || ns > bs
        } else if is_loss(ns) {
            false
        } else {
            let (bv, nv) = (votes[&move_of(best)], votes[&move_of(i)]);
            nv > bv || (nv == bv && depth_of(i) > depth_of(best))
        };
        if better {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nnue::Networks;
    use crate::search::{Callbacks, LimitsType, RootMove, SearchConfig};
    use crate::tb::NoTablebases;
    use crate::tt::TranspositionTable;
    use crate::types::{mate_in, mated_in};
    use std::sync::atomic::AtomicBool;

    fn result(uci: &str, score: i32, depth: i32) -> ThreadResult {
        let pos = Position::new();
        let mv = pos
            .legal_moves()
            .into_iter()
            .find(|&m| pos.move_to_uci(m) == uci)
            .unwrap();
        let mut rm = RootMove::new(mv);
        rm.score = score;
        ThreadResult {
            root_moves: vec![rm],
            completed_depth: depth,
        }
    }

    #[test]
    fn vote_prefers_majority_move() {
        let results = vec![
            result("e2e4", 30, 20),
            result("e2e4", 28, 20),
            result("d2d4", 35, 20),
        ];
        let best = select_best_thread(&results);
        // Two votes for e2e4 outweigh the slightly higher lone score.
        assert_eq!(
            results[best].root_moves[0].mv,
            results[0].root_moves[0].mv
        );
    }

    #[test]
    fn proven_mate_beats_the_ballot() {
        let results = vec![
            result("e2e4", 30, 25),
            result("e2e4", 31, 25),
            result("d2d4", mate_in(7), 12),
        ];
        assert_eq!(select_best_thread(&results), 2);
    }

    #[test]
    fn avoids_threads_that_found_a_loss() {
        let results = vec![result("e2e4", mated_in(9), 25), result("d2d4", -50, 18)];
        assert_eq!(select_best_thread(&results), 1);
    }

    #[test]
    fn pool_runs_a_search_and_reports_bestmove() {
        let pool = ThreadPool::new(2);
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        let reported = Arc::new(Mutex::new(String::new()));
        let reported2 = Arc::clone(&reported);
        let mut callbacks = Callbacks::default();
        callbacks.on_bestmove = Some(Box::new(move |info: &BestMoveInfo| {
            *reported2.lock() = info.bestmove.clone();
            done2.store(true, Ordering::Relaxed);
        }));

        let mut config = SearchConfig::default();
        config.threads = 2;
        let shared = Arc::new(SharedSearch::new(
            Arc::new(TranspositionTable::new(4, 2)),
            Arc::new(Networks::material_baseline()),
            Arc::new(NoTablebases),
            config,
            LimitsType { depth: Some(5), ..LimitsType::default() },
            callbacks,
        ));
        let pos = Position::from_fen("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1", false).unwrap();
        pool.start_thinking(shared, &pos);
        pool.wait_for_search_finished();
        assert!(done.load(Ordering::Relaxed));
        assert_eq!(&*reported.lock(), "a1a8");
    }

    #[test]
    fn stop_interrupts_an_infinite_search() {
        let pool = ThreadPool::new(1);
        let shared = Arc::new(SharedSearch::new(
            Arc::new(TranspositionTable::new(4, 1)),
            Arc::new(Networks::material_baseline()),
            Arc::new(NoTablebases),
            SearchConfig::default(),
            LimitsType { infinite: true, ..LimitsType::default() },
            Callbacks::default(),
        ));
        pool.start_thinking(shared, &Position::new());
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(pool.is_searching());
        pool.stop();
        pool.wait_for_search_finished();
        assert!(!pool.is_searching());
    }
}
