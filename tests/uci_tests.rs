//! UCI command handling through the protocol frontend.

use cinder::uci::{parse_go, UciHandler};

#[test]
fn quit_terminates_the_loop() {
    let mut handler = UciHandler::new();
    assert!(handler.execute("uci"));
    assert!(handler.execute("isready"));
    assert!(handler.execute(""));
    assert!(!handler.execute("quit"));
}

#[test]
fn unknown_commands_are_ignored() {
    let mut handler = UciHandler::new();
    assert!(handler.execute("xyzzy"));
    assert!(handler.execute("joke tell"));
}

#[test]
fn position_startpos_with_moves() {
    let mut handler = UciHandler::new();
    handler.execute("position startpos moves e2e4 c7c5 g1f3");
    let fen = handler.engine().position().fen();
    assert!(fen.starts_with("rnbqkb1r/pp1ppppp/8/2p5/4P3/5N2/PPPP1PPP/RNBQKB1R b"));
}

#[test]
fn position_from_fen() {
    let mut handler = UciHandler::new();
    handler.execute("position fen 6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1");
    assert!(handler
        .engine()
        .position()
        .fen()
        .starts_with("6k1/5ppp/8/8/8/8/5PPP/R5K1 w"));
}

#[test]
fn setoption_reaches_the_engine() {
    let mut handler = UciHandler::new();
    handler.execute("setoption name MultiPV value 3");
    assert_eq!(handler.engine().options().multi_pv, 3);
    handler.execute("setoption name Skill Level value 10");
    assert_eq!(handler.engine().options().skill_level, 10);
    handler.execute("setoption name UCI_Chess960 value true");
    assert!(handler.engine().options().chess960);
}

#[test]
fn bad_setoption_values_are_reported_not_applied() {
    let mut handler = UciHandler::new();
    handler.execute("setoption name MultiPV value over9000");
    assert_eq!(handler.engine().options().multi_pv, 1);
    handler.execute("setoption name Threads value 0");
    assert_eq!(handler.engine().options().threads, 1);
}

#[test]
fn go_depth_blocks_until_finished_via_wait() {
    let mut handler = UciHandler::new();
    handler.execute("position startpos");
    handler.execute("go depth 3");
    handler.engine().wait_for_search_finished();
}

#[test]
fn go_parsing_covers_the_protocol() {
    let limits = parse_go(&[
        "wtime", "300000", "btime", "300000", "winc", "2000", "binc", "2000",
    ]);
    assert!(limits.use_time_management());
    assert_eq!(limits.time, [300_000, 300_000]);

    let limits = parse_go(&["mate", "3"]);
    assert_eq!(limits.mate, Some(3));

    let limits = parse_go(&["perft", "4"]);
    assert_eq!(limits.perft, Some(4));

    let limits = parse_go(&["searchmoves", "e2e4", "d2d4", "infinite"]);
    assert_eq!(limits.searchmoves.len(), 2);
    assert!(limits.infinite);
}

#[test]
fn stop_and_ponderhit_are_safe_when_idle() {
    let mut handler = UciHandler::new();
    assert!(handler.execute("stop"));
    assert!(handler.execute("ponderhit"));
}
