//! Cinder: a UCI chess engine library.
//!
//! The crate is usable two ways: as a binary speaking UCI on stdio, and
//! as a library through [`engine::Engine`], which exposes the same
//! operations (set position, search with limits, callbacks for progress
//! and the final move) without any protocol layer.

pub mod engine;
pub mod history;
pub mod movepick;
pub mod nnue;
pub mod options;
pub mod position;
pub mod search;
pub mod tb;
pub mod threads;
pub mod timeman;
pub mod tt;
pub mod types;
pub mod uci;

pub use engine::{Engine, EngineError};
pub use position::Position;
pub use search::LimitsType;
