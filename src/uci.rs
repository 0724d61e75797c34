//! UCI protocol frontend over the engine façade.
//!
//! Commands map one-to-one onto engine calls; engine callbacks map back
//! onto `info` and `bestmove` lines. Unknown commands are ignored, as the
//! protocol demands.

use std::io::BufRead;
use std::time::Instant;

use log::warn;

use crate::engine::Engine;
use crate::options::uci_option_lines;
use crate::search::{LimitsType, UpdateFullInfo};
use crate::types::Depth;

pub const ENGINE_NAME: &str = concat!("Cinder ", env!("CARGO_PKG_VERSION"));
pub const ENGINE_AUTHORS: &str = "the Cinder developers";

pub struct UciHandler {
    engine: Engine,
}

impl UciHandler {
    #[must_use]
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_on_update_full(|info| println!("{}", format_update_full(info)));
        engine.set_on_update_no_moves(|info| {
            println!(
                "info depth {} score {}",
                info.depth,
                info.score.format_uci()
            );
        });
        engine.set_on_iter(|info| {
            println!(
                "info depth {} currmove {} currmovenumber {}",
                info.depth, info.currmove, info.currmovenumber
            );
        });
        engine.set_on_bestmove(|info| match &info.ponder {
            Some(p) => println!("bestmove {} ponder {}", info.bestmove, p),
            None => println!("bestmove {}", info.bestmove),
        });
        UciHandler { engine }
    }

    /// The underlying engine, for embedders that mix UCI with direct calls.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Read commands until `quit` or EOF.
    pub fn run(&mut self) {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if !self.execute(&line) {
                break;
            }
        }
        self.engine.stop();
        self.engine.wait_for_search_finished();
    }

    /// Handle one command line. Returns false on `quit`.
    pub fn execute(&mut self, line: &str) -> bool {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return true;
        };
        match command {
            "uci" => {
                println!("id name {ENGINE_NAME}");
                println!("id author {ENGINE_AUTHORS}");
                for option in uci_option_lines() {
                    println!("{option}");
                }
                println!("uciok");
            }
            "isready" => println!("readyok"),
            "setoption" => self.handle_setoption(&tokens[1..]),
            "ucinewgame" => self.engine.search_clear(),
            "position" => {
                if let Err(e) = handle_position(&mut self.engine, &tokens[1..]) {
                    println!("info string {e}");
                }
            }
            "go" => self.handle_go(&tokens[1..]),
            "stop" => self.engine.stop(),
            "ponderhit" => self.engine.set_ponderhit(),
            "d" => println!("{}", self.engine.position().fen()),
            "quit" => return false,
            _ => warn!("ignoring unknown command '{command}'"),
        }
        true
    }

    fn handle_setoption(&mut self, tokens: &[&str]) {
        // setoption name <name with spaces> [value <value with spaces>]
        let Some(name_at) = tokens.iter().position(|&t| t == "name") else {
            return;
        };
        let value_at = tokens.iter().position(|&t| t == "value");
        let name_end = value_at.unwrap_or(tokens.len());
        let name = tokens[name_at + 1..name_end].join(" ");
        let value = value_at.map_or(String::new(), |i| tokens[i + 1..].join(" "));
        if let Err(e) = self.engine.set_option(&name, &value) {
            println!("info string {e}");
        }
    }

    fn handle_go(&mut self, tokens: &[&str]) {
        let limits = parse_go(tokens);
        if let Some(depth) = limits.perft {
            let start = Instant::now();
            let nodes = self.engine.perft(depth);
            let ms = start.elapsed().as_millis().max(1);
            println!("info string perft {depth}: {nodes} nodes in {ms} ms");
            println!("nodes searched: {nodes}");
            return;
        }
        if let Err(e) = self.engine.go(limits) {
            println!("info string {e}");
        }
    }
}

impl Default for UciHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn handle_position(engine: &mut Engine, tokens: &[&str]) -> Result<(), crate::engine::EngineError> {
    let moves_at = tokens.iter().position(|&t| t == "moves");
    let setup = &tokens[..moves_at.unwrap_or(tokens.len())];
    let moves: Vec<String> = moves_at
        .map(|i| tokens[i + 1..].iter().map(|s| (*s).to_string()).collect())
        .unwrap_or_default();

    match setup.first() {
        Some(&"startpos") | None => engine.set_position(None, &moves),
        Some(&"fen") => {
            let fen = setup[1..].join(" ");
            engine.set_position(Some(&fen), &moves)
        }
        Some(other) => {
            warn!("unrecognized position setup '{other}'");
            Ok(())
        }
    }
}

/// Parse the `go` argument list. Unknown tokens are skipped.
#[must_use]
pub fn parse_go(tokens: &[&str]) -> LimitsType {
    let mut limits = LimitsType::default();
    let num = |idx: usize| -> i64 {
        tokens.get(idx).and_then(|t| t.parse().ok()).unwrap_or(0)
    };
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        i += 1;
        match token {
            "wtime" => { limits.time[0] = num(i); i += 1; }
            "btime" => { limits.time[1] = num(i); i += 1; }
            "winc" => { limits.inc[0] = num(i); i += 1; }
            "binc" => { limits.inc[1] = num(i); i += 1; }
            "movestogo" => { limits.movestogo = num(i) as i32; i += 1; }
            "depth" => { limits.depth = Some(num(i) as Depth); i += 1; }
            "nodes" => { limits.nodes = Some(num(i).max(0) as u64); i += 1; }
            "movetime" => { limits.movetime = Some(num(i)); i += 1; }
            "mate" => { limits.mate = Some(num(i) as i32); i += 1; }
            "perft" => { limits.perft = Some(num(i) as Depth); i += 1; }
            "infinite" => limits.infinite = true,
            "ponder" => limits.ponder = true,
            "searchmoves" => {
                while i < tokens.len() && looks_like_move(tokens[i]) {
                    limits.searchmoves.push(tokens[i].to_string());
                    i += 1;
                }
            }
            _ => {}
        }
    }
    limits
}

fn looks_like_move(token: &str) -> bool {
    token.len() >= 4
        && token.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && token.chars().nth(1).is_some_and(|c| c.is_ascii_digit())
}

/// One `info` line per PV update.
#[must_use]
pub fn format_update_full(info: &UpdateFullInfo) -> String {
    let mut line = format!(
        "info depth {} seldepth {} multipv {} score {}",
        info.depth,
        info.sel_depth,
        info.multipv,
        info.score.format_uci()
    );
    if let Some(bound) = info.bound {
        line.push_str(if bound == crate::types::Bound::Lower {
            " lowerbound"
        } else {
            " upperbound"
        });
    }
    if let Some(wdl) = info.wdl {
        line.push_str(&format!(" wdl {} {} {}", wdl.win, wdl.draw, wdl.loss));
    }
    line.push_str(&format!(
        " nodes {} nps {} hashfull {} tbhits {} time {} pv {}",
        info.nodes, info.nps, info.hashfull, info.tb_hits, info.time_ms, info.pv
    ));
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bound, Score, WdlStats};

    #[test]
    fn go_clock_tokens() {
        let limits = parse_go(&["wtime", "60000", "btime", "55000", "winc", "1000", "binc",
            "1000", "movestogo", "40"]);
        assert_eq!(limits.time, [60000, 55000]);
        assert_eq!(limits.inc, [1000, 1000]);
        assert_eq!(limits.movestogo, 40);
        assert!(limits.use_time_management());
    }

    #[test]
    fn go_fixed_limits() {
        let limits = parse_go(&["depth", "12", "nodes", "500000", "movetime", "2500"]);
        assert_eq!(limits.depth, Some(12));
        assert_eq!(limits.nodes, Some(500_000));
        assert_eq!(limits.movetime, Some(2500));
        assert!(!limits.use_time_management());
    }

    #[test]
    fn go_infinite_and_searchmoves() {
        let limits = parse_go(&["infinite", "searchmoves", "e2e4", "g1f3"]);
        assert!(limits.infinite);
        assert_eq!(limits.searchmoves, vec!["e2e4", "g1f3"]);
    }

    #[test]
    fn go_ponder_flag() {
        let limits = parse_go(&["ponder", "wtime", "10000", "btime", "10000"]);
        assert!(limits.ponder);
    }

    #[test]
    fn info_line_layout() {
        let info = UpdateFullInfo {
            depth: 12,
            sel_depth: 18,
            multipv: 1,
            score: Score::Cp(35),
            wdl: Some(WdlStats { win: 250, draw: 600, loss: 150 }),
            bound: None,
            nodes: 1_000_000,
            nps: 900_000,
            hashfull: 123,
            tb_hits: 0,
            time_ms: 1111,
            pv: "e2e4 e7e5".to_string(),
        };
        let line = format_update_full(&info);
        assert_eq!(
            line,
            "info depth 12 seldepth 18 multipv 1 score cp 35 wdl 250 600 150 \
             nodes 1000000 nps 900000 hashfull 123 tbhits 0 time 1111 pv e2e4 e7e5"
        );
    }

    #[test]
    fn bound_suffix_on_partial_scores() {
        let info = UpdateFullInfo {
            depth: 9,
            sel_depth: 12,
            multipv: 1,
            score: Score::Cp(80),
            wdl: None,
            bound: Some(Bound::Lower),
            nodes: 1,
            nps: 1,
            hashfull: 0,
            tb_hits: 0,
            time_ms: 1,
            pv: "d2d4".to_string(),
        };
        assert!(format_update_full(&info).contains("score cp 80 lowerbound"));
    }
}
