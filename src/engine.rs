//! The engine façade: one struct owning the position, the option set,
//! the shared tables and the worker pool. A UCI frontend (or an embedding
//! program) drives it through non-blocking calls and receives progress
//! through registered callbacks.

use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::nnue::{NetworkError, Networks};
use crate::options::{EngineOptions, OptionError};
use crate::position::{Position, PositionError};
use crate::search::{
    BestMoveInfo, Callbacks, IterInfo, LimitsType, SharedSearch, UpdateFullInfo,
    UpdateNoMovesInfo,
};
use crate::tb::{NoTablebases, Tablebases};
use crate::threads::ThreadPool;
use crate::tt::TranspositionTable;
use crate::types::Depth;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Option(#[from] OptionError),
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("search already running")]
    Busy,
}

type ArcCb<T> = Option<Arc<dyn Fn(&T) + Send + Sync>>;

#[derive(Default)]
struct StoredCallbacks {
    on_update_full: ArcCb<UpdateFullInfo>,
    on_update_no_moves: ArcCb<UpdateNoMovesInfo>,
    on_iter: ArcCb<IterInfo>,
    on_bestmove: ArcCb<BestMoveInfo>,
}

impl StoredCallbacks {
    /// Clone into the owned boxes a search carries.
    fn materialize(&self) -> Callbacks {
        fn boxed<T: 'static>(cb: &ArcCb<T>) -> Option<Box<dyn Fn(&T) + Send + Sync>> {
            cb.clone()
                .map(|f| Box::new(move |info: &T| f(info)) as Box<dyn Fn(&T) + Send + Sync>)
        }
        Callbacks {
            on_update_full: boxed(&self.on_update_full),
            on_update_no_moves: boxed(&self.on_update_no_moves),
            on_iter: boxed(&self.on_iter),
            on_bestmove: boxed(&self.on_bestmove),
        }
    }
}

pub struct Engine {
    options: EngineOptions,
    tt: Arc<TranspositionTable>,
    networks: Arc<Networks>,
    tb: Arc<dyn Tablebases>,
    pool: ThreadPool,
    pos: Position,
    callbacks: StoredCallbacks,
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        let options = EngineOptions::default();
        Engine {
            tt: Arc::new(TranspositionTable::new(options.hash_mb, options.threads)),
            networks: Arc::new(Networks::material_baseline()),
            tb: Arc::new(NoTablebases),
            pool: ThreadPool::new(options.threads),
            pos: Position::new(),
            callbacks: StoredCallbacks::default(),
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Apply a `setoption`. Options touching shared state (hash size,
    /// thread count, network files) take effect immediately; the rest are
    /// snapshotted at the next `go`.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        self.options.set(name, value)?;
        match name.to_ascii_lowercase().as_str() {
            "hash" => self.set_tt_size(self.options.hash_mb),
            "threads" => self.resize_threads(self.options.threads),
            "evalfile" => {
                if let Some(path) = self.options.eval_file.clone() {
                    self.load_big_network(&path)?;
                }
            }
            "evalfilesmall" => {
                if let Some(path) = self.options.eval_file_small.clone() {
                    self.load_small_network(&path)?;
                }
            }
            "syzygypath" => {
                // Probing stays behind the `Tablebases` trait; without a
                // decoding backend the path only gets remembered.
                if let Some(path) = &self.options.syzygy_path {
                    info!("tablebase path set to {path}, no probing backend built in");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Replace the board. `fen` of `None` means the standard start
    /// position; `moves` are UCI strings played from there.
    pub fn set_position(&mut self, fen: Option<&str>, moves: &[String]) -> Result<(), EngineError> {
        self.pool.wait_for_search_finished();
        let mut pos = match fen {
            Some(fen) => Position::from_fen(fen, self.options.chess960)?,
            None => Position::new(),
        };
        for mv in moves {
            pos.play_uci(mv)?;
        }
        self.pos = pos;
        Ok(())
    }

    #[must_use]
    pub fn position(&self) -> &Position {
        &self.pos
    }

    /// Start searching the current position. Non-blocking; progress and
    /// the final move arrive through the callbacks.
    pub fn go(&mut self, limits: LimitsType) -> Result<(), EngineError> {
        if self.pool.is_searching() {
            return Err(EngineError::Busy);
        }
        let shared = Arc::new(SharedSearch::new(
            Arc::clone(&self.tt),
            Arc::clone(&self.networks),
            Arc::clone(&self.tb),
            self.options.search_config(),
            limits,
            self.callbacks.materialize(),
        ));
        self.pool.start_thinking(shared, &self.pos);
        Ok(())
    }

    /// Count leaf nodes to `depth`; blocks, bypasses the pool.
    #[must_use]
    pub fn perft(&self, depth: Depth) -> u64 {
        let mut pos = self.pos.clone();
        crate::search::perft(&mut pos, depth)
    }

    pub fn stop(&self) {
        self.pool.stop();
    }

    /// The GUI played the expected move while we pondered.
    pub fn set_ponderhit(&self) {
        self.pool.ponderhit();
    }

    pub fn wait_for_search_finished(&self) {
        self.pool.wait_for_search_finished();
    }

    /// `ucinewgame`: clear the hash table and every thread's histories.
    pub fn search_clear(&mut self) {
        self.pool.wait_for_search_finished();
        self.tt.clear(self.options.threads);
        self.pool.clear();
    }

    pub fn resize_threads(&mut self, threads: usize) {
        self.pool.wait_for_search_finished();
        self.pool.set(threads);
    }

    pub fn set_tt_size(&mut self, mb: usize) {
        self.pool.wait_for_search_finished();
        if self.tt.capacity_mb() == mb {
            return;
        }
        // The table is shared by reference; swap in a fresh one rather
        // than mutate under the Arc.
        self.tt = Arc::new(TranspositionTable::new(mb, self.options.threads));
    }

    pub fn load_big_network(&mut self, path: &str) -> Result<(), EngineError> {
        self.pool.wait_for_search_finished();
        let mut networks = Networks {
            big: self.networks.big.clone(),
            small: self.networks.small.clone(),
        };
        networks.load_big(path)?;
        self.networks = Arc::new(networks);
        info!("loaded evaluation network from {path}");
        Ok(())
    }

    pub fn load_small_network(&mut self, path: &str) -> Result<(), EngineError> {
        self.pool.wait_for_search_finished();
        let mut networks = Networks {
            big: self.networks.big.clone(),
            small: self.networks.small.clone(),
        };
        networks.load_small(path)?;
        self.networks = Arc::new(networks);
        info!("loaded small evaluation network from {path}");
        Ok(())
    }

    pub fn save_networks(&self, big: &str, small: &str) -> Result<(), EngineError> {
        self.networks.save_big(big)?;
        self.networks.save_small(small)?;
        Ok(())
    }

    pub fn set_on_update_full(&mut self, cb: impl Fn(&UpdateFullInfo) + Send + Sync + 'static) {
        self.callbacks.on_update_full = Some(Arc::new(cb));
    }

    pub fn set_on_update_no_moves(
        &mut self,
        cb: impl Fn(&UpdateNoMovesInfo) + Send + Sync + 'static,
    ) {
        self.callbacks.on_update_no_moves = Some(Arc::new(cb));
    }

    pub fn set_on_iter(&mut self, cb: impl Fn(&IterInfo) + Send + Sync + 'static) {
        self.callbacks.on_iter = Some(Arc::new(cb));
    }

    pub fn set_on_bestmove(&mut self, cb: impl Fn(&BestMoveInfo) + Send + Sync + 'static) {
        self.callbacks.on_bestmove = Some(Arc::new(cb));
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
