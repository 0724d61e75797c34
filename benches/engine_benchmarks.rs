use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use cinder::nnue::{self, AccumulatorStack, Networks, RefreshTable};
use cinder::position::Position;
use cinder::search::{perft, Callbacks, LimitsType, SearchConfig, SharedSearch, Worker};
use cinder::tb::NoTablebases;
use cinder::tt::TranspositionTable;

const MIDDLEGAME: &str = "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1";

fn bench_perft(c: &mut Criterion) {
    c.bench_function("perft_startpos_4", |b| {
        let mut pos = Position::new();
        b.iter(|| perft(&mut pos, 4));
    });
    c.bench_function("perft_middlegame_3", |b| {
        let mut pos = Position::from_fen(MIDDLEGAME, false).unwrap();
        b.iter(|| perft(&mut pos, 3));
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let networks = Networks::material_baseline();
    let pos = Position::from_fen(MIDDLEGAME, false).unwrap();
    let mut stack = AccumulatorStack::new();
    stack.reset(&pos, &networks);
    c.bench_function("evaluate_middlegame", |b| {
        b.iter(|| nnue::evaluate(&networks, &pos, &stack, 0));
    });

    c.bench_function("accumulator_update", |b| {
        let mut pos = Position::new();
        let mut refresh = RefreshTable::new(&networks);
        let mut stack = AccumulatorStack::new();
        stack.reset(&pos, &networks);
        let mv = pos
            .legal_moves()
            .into_iter()
            .find(|&m| pos.move_to_uci(m) == "e2e4")
            .unwrap();
        b.iter(|| {
            let dirty = pos.do_move(mv);
            stack.push(&pos, &dirty, &networks, &mut refresh);
            stack.pop();
            pos.undo_move();
        });
    });
}

fn bench_search(c: &mut Criterion) {
    c.bench_function("search_middlegame_depth_6", |b| {
        let pos = Position::from_fen(MIDDLEGAME, false).unwrap();
        b.iter(|| {
            let shared = SharedSearch::new(
                Arc::new(TranspositionTable::new(16, 1)),
                Arc::new(Networks::material_baseline()),
                Arc::new(NoTablebases),
                SearchConfig::default(),
                LimitsType {
                    depth: Some(6),
                    ..LimitsType::default()
                },
                Callbacks::default(),
            );
            let mut worker = Worker::new(0);
            worker.start_search(&shared, pos.clone());
            worker.root_moves[0].mv
        });
    });
}

criterion_group!(benches, bench_perft, bench_evaluate, bench_search);
criterion_main!(benches);
