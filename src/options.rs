//! Engine options: typed storage, UCI-style string parsing, clamping.
//!
//! The engine snapshots these into a `SearchConfig` at `go` time, so a
//! `setoption` arriving mid-search never perturbs a running search.

use thiserror::Error;

use crate::search::params::{SKILL_HIGHEST_ELO, SKILL_LOWEST_ELO};
use crate::search::SearchConfig;
use crate::tb::TbConfig;

#[derive(Debug, Error)]
pub enum OptionError {
    #[error("unknown option '{0}'")]
    Unknown(String),
    #[error("invalid value '{value}' for option '{name}'")]
    InvalidValue { name: String, value: String },
    #[error("value {value} for option '{name}' outside {min}..={max}")]
    OutOfRange {
        name: String,
        value: i64,
        min: i64,
        max: i64,
    },
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub hash_mb: usize,
    pub threads: usize,
    pub multi_pv: usize,
    pub ponder: bool,
    pub move_overhead: i64,
    pub nodestime: i64,
    pub chess960: bool,
    pub show_wdl: bool,
    pub skill_level: i32,
    pub limit_strength: bool,
    pub elo: i32,
    pub syzygy_path: Option<String>,
    pub syzygy_probe_depth: i32,
    pub syzygy_50_move_rule: bool,
    pub syzygy_probe_limit: u32,
    pub eval_file: Option<String>,
    pub eval_file_small: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            hash_mb: 16,
            threads: 1,
            multi_pv: 1,
            ponder: false,
            move_overhead: 10,
            nodestime: 0,
            chess960: false,
            show_wdl: false,
            skill_level: 20,
            limit_strength: false,
            elo: SKILL_HIGHEST_ELO,
            syzygy_path: None,
            syzygy_probe_depth: 1,
            syzygy_50_move_rule: true,
            syzygy_probe_limit: 7,
            eval_file: None,
            eval_file_small: None,
        }
    }
}

/// Ranges advertised through `uci` and enforced by `set`.
pub const HASH_RANGE: (i64, i64) = (1, 1_048_576);
pub const THREADS_RANGE: (i64, i64) = (1, 1024);
pub const MULTI_PV_RANGE: (i64, i64) = (1, 256);
pub const MOVE_OVERHEAD_RANGE: (i64, i64) = (0, 5000);
pub const NODESTIME_RANGE: (i64, i64) = (0, 10_000);
pub const SKILL_LEVEL_RANGE: (i64, i64) = (0, 20);
pub const SYZYGY_PROBE_DEPTH_RANGE: (i64, i64) = (1, 100);
pub const SYZYGY_PROBE_LIMIT_RANGE: (i64, i64) = (0, 7);

impl EngineOptions {
    /// Apply one `setoption`. Option names are matched case-insensitively
    /// per UCI custom.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        match name.to_ascii_lowercase().as_str() {
            "hash" => self.hash_mb = parse_spin(name, value, HASH_RANGE)? as usize,
            "threads" => self.threads = parse_spin(name, value, THREADS_RANGE)? as usize,
            "multipv" => self.multi_pv = parse_spin(name, value, MULTI_PV_RANGE)? as usize,
            "ponder" => self.ponder = parse_check(name, value)?,
            "move overhead" => {
                self.move_overhead = parse_spin(name, value, MOVE_OVERHEAD_RANGE)?;
            }
            "nodestime" => self.nodestime = parse_spin(name, value, NODESTIME_RANGE)?,
            "uci_chess960" => self.chess960 = parse_check(name, value)?,
            "uci_showwdl" => self.show_wdl = parse_check(name, value)?,
            "skill level" => {
                self.skill_level = parse_spin(name, value, SKILL_LEVEL_RANGE)? as i32;
            }
            "uci_limitstrength" => self.limit_strength = parse_check(name, value)?,
            "uci_elo" => {
                self.elo = parse_spin(
                    name,
                    value,
                    (i64::from(SKILL_LOWEST_ELO), i64::from(SKILL_HIGHEST_ELO)),
                )? as i32;
            }
            "syzygypath" => {
                self.syzygy_path = match value {
                    "" | "<empty>" => None,
                    path => Some(path.to_string()),
                };
            }
            "syzygyprobedepth" => {
                self.syzygy_probe_depth =
                    parse_spin(name, value, SYZYGY_PROBE_DEPTH_RANGE)? as i32;
            }
            "syzygy50moverule" => self.syzygy_50_move_rule = parse_check(name, value)?,
            "syzygyprobelimit" => {
                self.syzygy_probe_limit =
                    parse_spin(name, value, SYZYGY_PROBE_LIMIT_RANGE)? as u32;
            }
            "evalfile" => {
                self.eval_file = match value {
                    "" | "<empty>" => None,
                    path => Some(path.to_string()),
                };
            }
            "evalfilesmall" => {
                self.eval_file_small = match value {
                    "" | "<empty>" => None,
                    path => Some(path.to_string()),
                };
            }
            _ => return Err(OptionError::Unknown(name.to_string())),
        }
        Ok(())
    }

    /// Skill level after folding in the Elo limiter. The cubic maps the
    /// advertised Elo span onto the internal 0..=19 scale.
    #[must_use]
    pub fn effective_skill_level(&self) -> i32 {
        if !self.limit_strength {
            return self.skill_level;
        }
        let e = f64::from(self.elo - SKILL_LOWEST_ELO)
            / f64::from(SKILL_HIGHEST_ELO - SKILL_LOWEST_ELO);
        let level = ((37.2473 * e - 40.8525) * e + 22.2943) * e - 0.311_438;
        (level.clamp(0.0, 19.0)) as i32
    }

    #[must_use]
    pub fn tb_config(&self) -> TbConfig {
        TbConfig {
            probe_limit: self.syzygy_probe_limit,
            probe_depth: self.syzygy_probe_depth,
            rule50: self.syzygy_50_move_rule,
        }
    }

    #[must_use]
    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            threads: self.threads,
            multi_pv: self.multi_pv,
            skill_level: self.effective_skill_level(),
            move_overhead: self.move_overhead,
            nodestime: self.nodestime,
            show_wdl: self.show_wdl,
            tb: self.tb_config(),
        }
    }
}

fn parse_spin(name: &str, value: &str, (min, max): (i64, i64)) -> Result<i64, OptionError> {
    let parsed: i64 = value.trim().parse().map_err(|_| OptionError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })?;
    if parsed < min || parsed > max {
        return Err(OptionError::OutOfRange {
            name: name.to_string(),
            value: parsed,
            min,
            max,
        });
    }
    Ok(parsed)
}

fn parse_check(name: &str, value: &str) -> Result<bool, OptionError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(OptionError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

/// One line per option for the `uci` handshake, in display order.
#[must_use]
pub fn uci_option_lines() -> Vec<String> {
    let d = EngineOptions::default();
    vec![
        spin("Hash", d.hash_mb as i64, HASH_RANGE),
        spin("Threads", d.threads as i64, THREADS_RANGE),
        spin("MultiPV", d.multi_pv as i64, MULTI_PV_RANGE),
        check("Ponder", d.ponder),
        spin("Move Overhead", d.move_overhead, MOVE_OVERHEAD_RANGE),
        spin("nodestime", d.nodestime, NODESTIME_RANGE),
        check("UCI_Chess960", d.chess960),
        check("UCI_ShowWDL", d.show_wdl),
        spin("Skill Level", i64::from(d.skill_level), SKILL_LEVEL_RANGE),
        check("UCI_LimitStrength", d.limit_strength),
        spin(
            "UCI_Elo",
            i64::from(d.elo),
            (i64::from(SKILL_LOWEST_ELO), i64::from(SKILL_HIGHEST_ELO)),
        ),
        string("SyzygyPath", "<empty>"),
        spin(
            "SyzygyProbeDepth",
            i64::from(d.syzygy_probe_depth),
            SYZYGY_PROBE_DEPTH_RANGE,
        ),
        check("Syzygy50MoveRule", d.syzygy_50_move_rule),
        spin(
            "SyzygyProbeLimit",
            i64::from(d.syzygy_probe_limit),
            SYZYGY_PROBE_LIMIT_RANGE,
        ),
        string("EvalFile", "<empty>"),
        string("EvalFileSmall", "<empty>"),
    ]
}

fn spin(name: &str, default: i64, (min, max): (i64, i64)) -> String {
    format!("option name {name} type spin default {default} min {min} max {max}")
}

fn check(name: &str, default: bool) -> String {
    format!("option name {name} type check default {default}")
}

fn string(name: &str, default: &str) -> String {
    format!("option name {name} type string default {default}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_parses_and_clamps() {
        let mut opts = EngineOptions::default();
        opts.set("Hash", "128").unwrap();
        assert_eq!(opts.hash_mb, 128);
        opts.set("Threads", "4").unwrap();
        assert_eq!(opts.threads, 4);
        opts.set("MultiPV", "3").unwrap();
        assert_eq!(opts.multi_pv, 3);
        opts.set("UCI_Chess960", "true").unwrap();
        assert!(opts.chess960);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut opts = EngineOptions::default();
        assert!(matches!(
            opts.set("Threads", "0"),
            Err(OptionError::OutOfRange { .. })
        ));
        assert!(matches!(
            opts.set("Hash", "notanumber"),
            Err(OptionError::InvalidValue { .. })
        ));
        assert!(matches!(
            opts.set("NoSuchOption", "1"),
            Err(OptionError::Unknown(_))
        ));
    }

    #[test]
    fn option_names_are_case_insensitive() {
        let mut opts = EngineOptions::default();
        opts.set("hash", "64").unwrap();
        opts.set("HASH", "32").unwrap();
        assert_eq!(opts.hash_mb, 32);
    }

    #[test]
    fn empty_path_clears_the_option() {
        let mut opts = EngineOptions::default();
        opts.set("SyzygyPath", "/tb/wdl").unwrap();
        assert_eq!(opts.syzygy_path.as_deref(), Some("/tb/wdl"));
        opts.set("SyzygyPath", "<empty>").unwrap();
        assert!(opts.syzygy_path.is_none());
    }

    #[test]
    fn elo_limiter_maps_onto_skill_levels() {
        let mut opts = EngineOptions::default();
        opts.set("UCI_LimitStrength", "true").unwrap();
        opts.set("UCI_Elo", "1320").unwrap();
        assert_eq!(opts.effective_skill_level(), 0);
        opts.set("UCI_Elo", "3190").unwrap();
        assert!(opts.effective_skill_level() >= 18);
        opts.set("UCI_LimitStrength", "false").unwrap();
        assert_eq!(opts.effective_skill_level(), 20);
    }

    #[test]
    fn handshake_lists_every_option() {
        let lines = uci_option_lines();
        assert!(lines.iter().any(|l| l.starts_with("option name Hash ")));
        assert!(lines.iter().any(|l| l.contains("UCI_Elo")));
        assert!(lines.iter().any(|l| l.contains("SyzygyPath")));
        for line in &lines {
            assert!(line.starts_with("option name "));
        }
    }
}
