//! End-to-end searches through the public engine façade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use cinder::search::UpdateFullInfo;
use cinder::{Engine, LimitsType};

struct BestMoveProbe {
    done: Arc<AtomicBool>,
    best: Arc<Mutex<String>>,
}

fn hook_bestmove(engine: &mut Engine) -> BestMoveProbe {
    let done = Arc::new(AtomicBool::new(false));
    let best = Arc::new(Mutex::new(String::new()));
    let (done2, best2) = (Arc::clone(&done), Arc::clone(&best));
    engine.set_on_bestmove(move |info| {
        *best2.lock() = info.bestmove.clone();
        done2.store(true, Ordering::Relaxed);
    });
    BestMoveProbe { done, best }
}

fn search_to_depth(engine: &mut Engine, depth: i32) {
    engine
        .go(LimitsType {
            depth: Some(depth),
            ..LimitsType::default()
        })
        .unwrap();
    engine.wait_for_search_finished();
}

#[test]
fn finds_back_rank_mate() {
    let mut engine = Engine::new();
    let probe = hook_bestmove(&mut engine);
    engine
        .set_position(Some("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1"), &[])
        .unwrap();
    search_to_depth(&mut engine, 5);
    assert!(probe.done.load(Ordering::Relaxed));
    assert_eq!(&*probe.best.lock(), "a1a8");
}

#[test]
fn takes_the_hanging_queen() {
    let mut engine = Engine::new();
    let probe = hook_bestmove(&mut engine);
    // In check from an undefended adjacent queen: capturing is the only
    // move that does not lose on the spot.
    engine
        .set_position(Some("7k/8/8/8/8/8/5q2/6K1 w - - 0 1"), &[])
        .unwrap();
    search_to_depth(&mut engine, 6);
    assert_eq!(&*probe.best.lock(), "g1f2");
}

#[test]
fn checkmated_position_reports_none() {
    let mut engine = Engine::new();
    let probe = hook_bestmove(&mut engine);
    engine
        .set_position(Some("R5k1/5ppp/8/8/8/8/8/6K1 b - - 0 1"), &[])
        .unwrap();
    search_to_depth(&mut engine, 3);
    assert_eq!(&*probe.best.lock(), "(none)");
}

#[test]
fn multipv_reports_distinct_ranked_lines() {
    let mut engine = Engine::new();
    engine.set_option("MultiPV", "3").unwrap();
    let lines: Arc<Mutex<Vec<(usize, i32, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let lines2 = Arc::clone(&lines);
    engine.set_on_update_full(move |info: &UpdateFullInfo| {
        let score = match info.score {
            cinder::types::Score::Cp(cp) => cp,
            _ => 30_000,
        };
        lines2.lock().push((info.multipv, score, info.pv.clone()));
    });
    search_to_depth(&mut engine, 6);

    let lines = lines.lock();
    // Take the last full round of multipv updates.
    let final_round: Vec<_> = lines.iter().rev().take(3).cloned().collect();
    let mut seen: Vec<usize> = final_round.iter().map(|(idx, _, _)| *idx).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);

    let mut by_rank = final_round.clone();
    by_rank.sort_by_key(|(idx, _, _)| *idx);
    assert!(by_rank[0].1 >= by_rank[1].1);
    assert!(by_rank[1].1 >= by_rank[2].1);
    let first_moves: Vec<&str> = by_rank
        .iter()
        .map(|(_, _, pv)| pv.split_whitespace().next().unwrap_or(""))
        .collect();
    assert_ne!(first_moves[0], first_moves[1]);
    assert_ne!(first_moves[1], first_moves[2]);
}

#[test]
fn repeated_search_is_consistent() {
    let mut engine = Engine::new();
    let probe = hook_bestmove(&mut engine);
    engine.search_clear();
    engine
        .set_position(Some("4k3/8/8/3r4/8/8/3Q4/4K3 w - - 0 1"), &[])
        .unwrap();
    search_to_depth(&mut engine, 7);
    let first = probe.best.lock().clone();
    // Same position again without clearing: the warm transposition table
    // must not change the answer.
    search_to_depth(&mut engine, 7);
    let second = probe.best.lock().clone();
    assert_eq!(first, "d2d5");
    assert_eq!(first, second);
}

#[test]
fn node_limited_search_terminates() {
    let mut engine = Engine::new();
    let probe = hook_bestmove(&mut engine);
    engine
        .go(LimitsType {
            nodes: Some(50_000),
            ..LimitsType::default()
        })
        .unwrap();
    engine.wait_for_search_finished();
    assert!(probe.done.load(Ordering::Relaxed));
    assert_ne!(&*probe.best.lock(), "(none)");
}

#[test]
fn stop_ends_an_infinite_search_with_a_bestmove() {
    let mut engine = Engine::new();
    let probe = hook_bestmove(&mut engine);
    engine
        .go(LimitsType {
            infinite: true,
            ..LimitsType::default()
        })
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(100));
    engine.stop();
    engine.wait_for_search_finished();
    assert!(probe.done.load(Ordering::Relaxed));
    assert_ne!(&*probe.best.lock(), "(none)");
}

#[test]
fn two_threads_agree_on_a_tactic() {
    let mut engine = Engine::new();
    engine.set_option("Threads", "2").unwrap();
    let probe = hook_bestmove(&mut engine);
    engine
        .set_position(Some("4k3/8/8/3r4/8/8/3Q4/4K3 w - - 0 1"), &[])
        .unwrap();
    search_to_depth(&mut engine, 6);
    assert_eq!(&*probe.best.lock(), "d2d5");
}

#[test]
fn movetime_is_respected_loosely() {
    let mut engine = Engine::new();
    let probe = hook_bestmove(&mut engine);
    let start = std::time::Instant::now();
    engine
        .go(LimitsType {
            movetime: Some(200),
            ..LimitsType::default()
        })
        .unwrap();
    engine.wait_for_search_finished();
    assert!(probe.done.load(Ordering::Relaxed));
    // Generous margin: the poll interval and bestmove bookkeeping add
    // latency, but nothing near an unbounded search.
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}
