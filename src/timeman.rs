//! Time budgeting for a single search.
//!
//! `init` turns clock, increment and movestogo into an `optimum` and a
//! `maximum` thinking time. The search consults `optimum` after every
//! iteration (scaled by score and PV stability factors it computes
//! itself) and treats `maximum` as a hard wall.

use std::time::Instant;

use cozy_chess::Color;

use crate::search::LimitsType;

/// Milliseconds, or node counts when "nodes as time" mode is active.
pub type TimePoint = i64;

pub struct TimeManager {
    start_time: Instant,
    optimum_time: TimePoint,
    maximum_time: TimePoint,
    /// Remaining node budget in nodes-as-time mode, -1 when unused.
    available_nodes: i64,
    use_nodes_time: bool,
}

impl TimeManager {
    #[must_use]
    pub fn new() -> Self {
        TimeManager {
            start_time: Instant::now(),
            optimum_time: 0,
            maximum_time: 0,
            available_nodes: -1,
            use_nodes_time: false,
        }
    }

    /// Compute the budgets for one `go`. `overhead` covers protocol and
    /// callback latency, `npmsec` enables nodes-as-time when nonzero,
    /// `adjust` rescales the optimum (used by the strength limiter).
    pub fn init(
        &mut self,
        limits: &LimitsType,
        us: Color,
        ply: u32,
        overhead: TimePoint,
        npmsec: i64,
        adjust: f64,
    ) {
        self.start_time = limits.start_time;
        self.optimum_time = 0;
        self.maximum_time = 0;

        let mut my_time = limits.time[us as usize];
        let mut inc = limits.inc[us as usize];

        // Nodes-as-time: reinterpret the clock in search nodes so test
        // games are reproducible across hardware. The budget carries over
        // between moves of one game.
        self.use_nodes_time = npmsec > 0;
        if self.use_nodes_time && my_time > 0 {
            if self.available_nodes < 0 {
                self.available_nodes = npmsec * my_time;
            }
            my_time = self.available_nodes.max(0);
            inc *= npmsec;
        }

        if my_time <= 0 {
            // Depth, nodes, movetime or infinite: no clock to manage.
            return;
        }

        let ply = f64::from(ply);

        // Move horizon in centimoves. 5051 approximates sudden death.
        let mut centi_mtg: i64 = match limits.movestogo {
            0 => 5051,
            n => (i64::from(n) * 100).min(5000),
        };
        let scaled_time = my_time as f64 / (centi_mtg as f64 / 100.0).max(1.0);
        if scaled_time < 1000.0 && centi_mtg > 100 {
            centi_mtg = ((my_time as f64 * 0.05051) as i64).max(100).min(centi_mtg);
        }

        let time_left =
            (my_time + (inc * (centi_mtg - 100) - overhead * (200 + centi_mtg)) / 100).max(1)
                as f64;

        let (opt_scale, max_scale) = if limits.movestogo == 0 {
            let log_time = (scaled_time / 1000.0).max(1e-3).log10();
            let opt_const = (0.00308 + 0.000319 * log_time).min(0.00506).max(0.0);
            let max_const = (3.39 + 3.01 * log_time).max(2.93);
            let opt = (0.0121 + (ply + 2.95).powf(0.461) * opt_const)
                .min(0.213 * my_time as f64 / time_left);
            let max = (max_const + ply / 11.98).min(6.67);
            (opt, max)
        } else {
            let mtg = centi_mtg as f64 / 100.0;
            let opt = ((0.88 + ply / 116.4) / mtg).min(0.88 * my_time as f64 / time_left);
            let max = (1.5 + 0.11 * mtg).min(6.3);
            (opt, max)
        };

        self.optimum_time = (opt_scale * adjust * time_left) as TimePoint;
        self.maximum_time = (((my_time as f64 * 0.825 - overhead as f64)
            .min(max_scale * self.optimum_time as f64))
            as TimePoint
            - 10)
            .max(1);

        if limits.ponder {
            self.optimum_time += self.optimum_time / 4;
        }
    }

    #[must_use]
    pub fn optimum(&self) -> TimePoint {
        self.optimum_time
    }

    #[must_use]
    pub fn maximum(&self) -> TimePoint {
        self.maximum_time
    }

    /// Elapsed budget: searched nodes in nodes-as-time mode, wall clock
    /// milliseconds otherwise.
    pub fn elapsed<F: FnOnce() -> u64>(&self, nodes: F) -> TimePoint {
        if self.use_nodes_time {
            nodes() as TimePoint
        } else {
            self.elapsed_time()
        }
    }

    /// Wall clock milliseconds since `init`, regardless of mode.
    #[must_use]
    pub fn elapsed_time(&self) -> TimePoint {
        self.start_time.elapsed().as_millis() as TimePoint
    }

    /// Charge this search's nodes against the rolling budget.
    pub fn consume_nodes(&mut self, nodes: u64) {
        if self.use_nodes_time {
            self.available_nodes = (self.available_nodes - nodes as i64).max(0);
        }
    }

    #[must_use]
    pub fn use_nodes_time(&self) -> bool {
        self.use_nodes_time
    }
}

impl Default for TimeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits_with_time(time_ms: i64, inc_ms: i64, movestogo: i32) -> LimitsType {
        LimitsType {
            time: [time_ms, time_ms],
            inc: [inc_ms, inc_ms],
            movestogo,
            ..LimitsType::default()
        }
    }

    #[test]
    fn no_clock_means_no_budget() {
        let mut tm = TimeManager::new();
        tm.init(&LimitsType::default(), Color::White, 0, 10, 0, 1.0);
        assert_eq!(tm.optimum(), 0);
        assert_eq!(tm.maximum(), 0);
    }

    #[test]
    fn optimum_below_maximum_below_remaining() {
        let mut tm = TimeManager::new();
        tm.init(&limits_with_time(60_000, 600, 0), Color::White, 20, 10, 0, 1.0);
        assert!(tm.optimum() > 0);
        assert!(tm.optimum() <= tm.maximum());
        assert!(tm.maximum() < 60_000);
    }

    #[test]
    fn more_time_on_the_clock_means_more_budget() {
        let mut short = TimeManager::new();
        short.init(&limits_with_time(5_000, 0, 0), Color::White, 20, 10, 0, 1.0);
        let mut long = TimeManager::new();
        long.init(&limits_with_time(300_000, 0, 0), Color::White, 20, 10, 0, 1.0);
        assert!(long.optimum() > short.optimum());
        assert!(long.maximum() > short.maximum());
    }

    #[test]
    fn movestogo_splits_the_clock() {
        let mut tm = TimeManager::new();
        tm.init(&limits_with_time(60_000, 0, 1), Color::White, 20, 10, 0, 1.0);
        // Last move before the control: nearly the whole clock is usable.
        assert!(tm.maximum() > 30_000);

        let mut many = TimeManager::new();
        many.init(&limits_with_time(60_000, 0, 40), Color::White, 20, 10, 0, 1.0);
        assert!(many.optimum() < tm.optimum());
    }

    #[test]
    fn ponder_inflates_optimum() {
        let mut plain = TimeManager::new();
        plain.init(&limits_with_time(60_000, 0, 0), Color::White, 20, 10, 0, 1.0);
        let mut ponder = TimeManager::new();
        let mut limits = limits_with_time(60_000, 0, 0);
        limits.ponder = true;
        ponder.init(&limits, Color::White, 20, 10, 0, 1.0);
        assert!(ponder.optimum() > plain.optimum());
    }

    #[test]
    fn nodes_time_measures_elapsed_in_nodes() {
        let mut tm = TimeManager::new();
        tm.init(&limits_with_time(1_000, 0, 0), Color::White, 0, 10, 1000, 1.0);
        assert!(tm.use_nodes_time());
        assert_eq!(tm.elapsed(|| 12_345), 12_345);
    }
}
