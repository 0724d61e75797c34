//! Shared transposition table.
//!
//! Lockless bucketed cache shared by all search workers. Each entry is a
//! pair of atomic words storing the packed payload and `key ^ payload`; a
//! torn read fails the XOR check and is reported as a miss, so probes never
//! need a lock and racy writes are individually tear-safe.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use cozy_chess::{Move, Square};

use crate::types::{
    is_decisive, is_loss, is_win, Bound, Depth, Value, DEPTH_ENTRY_OFFSET, VALUE_NONE,
    VALUE_TB_LOSS_IN_MAX_PLY, VALUE_TB_WIN_IN_MAX_PLY,
};

/// Entries per bucket.
const CLUSTER_SIZE: usize = 3;

/// Generations wrap at this modulus (5 bits of the packed word).
const GENERATION_CYCLE: u8 = 32;

/// Snapshot of a probed entry. Values are still in TT encoding; the search
/// converts with `value_from_tt`.
#[derive(Clone, Copy, Debug)]
pub struct TTData {
    pub mv: Option<Move>,
    pub value: Value,
    pub eval: Value,
    pub depth: Depth,
    pub bound: Bound,
    pub is_pv: bool,
}

/// Handle for writing back into the bucket that was probed.
#[derive(Clone, Copy)]
pub struct TTWriter {
    bucket: usize,
}

// Packed entry layout (64 bits):
//   bits  0-15  move
//   bits 16-31  value (i16)
//   bits 32-47  eval (i16)
//   bits 48-55  depth + DEPTH_ENTRY_OFFSET
//   bits 56-63  generation (5) | pv (1) | bound (2)
fn pack(mv: Option<Move>, value: Value, eval: Value, depth: Depth, bound: Bound, is_pv: bool, generation: u8) -> u64 {
    let mv_bits = mv.map_or(0, move_to_u16);
    let value16 = value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16 as u16;
    let eval16 = eval.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16 as u16;
    let depth8 = (depth - DEPTH_ENTRY_OFFSET).clamp(0, 255) as u64;
    let meta = u64::from(generation % GENERATION_CYCLE) << 3
        | u64::from(is_pv) << 2
        | u64::from(bound.bits());
    u64::from(mv_bits)
        | u64::from(value16) << 16
        | u64::from(eval16) << 32
        | depth8 << 48
        | meta << 56
}

fn unpack(data: u64) -> TTData {
    let mv_bits = (data & 0xFFFF) as u16;
    TTData {
        mv: if mv_bits == 0 { None } else { Some(move_from_u16(mv_bits)) },
        value: Value::from((data >> 16) as u16 as i16),
        eval: Value::from((data >> 32) as u16 as i16),
        depth: ((data >> 48) & 0xFF) as Depth + DEPTH_ENTRY_OFFSET,
        bound: Bound::from_bits((data >> 56) as u8 & 0x3),
        is_pv: (data >> 58) & 1 == 1,
    }
}

fn generation_of(data: u64) -> u8 {
    ((data >> 59) & 0x1F) as u8
}

fn depth8_of(data: u64) -> i32 {
    ((data >> 48) & 0xFF) as i32
}

/// 16-bit move encoding: from (6) | to (6) | promotion (3, 0 = none).
/// The all-zero pattern is reserved for "no move", so `a1a1` never collides.
fn move_to_u16(mv: Move) -> u16 {
    let promo = mv.promotion.map_or(0, |p| p as u16 + 1);
    let bits = (mv.from as u16) | (mv.to as u16) << 6 | promo << 12;
    if bits == 0 {
        // from == to == a1 cannot be a legal move; keep a distinct encoding.
        1 << 15
    } else {
        bits
    }
}

fn move_from_u16(bits: u16) -> Move {
    let bits = if bits == 1 << 15 { 0 } else { bits };
    let from = Square::index_const((bits & 0x3F) as usize);
    let to = Square::index_const(((bits >> 6) & 0x3F) as usize);
    let promo = (bits >> 12) & 0x7;
    Move {
        from,
        to,
        promotion: if promo == 0 {
            None
        } else {
            Some(cozy_chess::Piece::index_const(promo as usize - 1))
        },
    }
}

struct Slot {
    key_xor: AtomicU64,
    data: AtomicU64,
}

impl Slot {
    const fn new() -> Self {
        Slot {
            key_xor: AtomicU64::new(0),
            data: AtomicU64::new(0),
        }
    }

    fn store(&self, key: u64, packed: u64) {
        self.data.store(packed, Ordering::Relaxed);
        self.key_xor.store(key ^ packed, Ordering::Relaxed);
    }

    /// Returns the packed payload if the XOR check passes for `key`.
    fn load(&self, key: u64) -> Option<u64> {
        let key_xor = self.key_xor.load(Ordering::Relaxed);
        let data = self.data.load(Ordering::Relaxed);
        if data != 0 && key_xor ^ data == key {
            Some(data)
        } else {
            None
        }
    }

    fn raw(&self) -> u64 {
        self.data.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.data.store(0, Ordering::Relaxed);
        self.key_xor.store(0, Ordering::Relaxed);
    }
}

struct Bucket {
    slots: [Slot; CLUSTER_SIZE],
}

impl Bucket {
    const fn new() -> Self {
        Bucket {
            slots: [Slot::new(), Slot::new(), Slot::new()],
        }
    }
}

/// The shared transposition table. All methods take `&self`; concurrent use
/// from any number of workers is safe (probes are advisory only).
pub struct TranspositionTable {
    buckets: Vec<Bucket>,
    generation: AtomicU8,
}

impl TranspositionTable {
    /// Create a table targeting `mb` megabytes, zeroed in parallel across
    /// `threads` helpers.
    #[must_use]
    pub fn new(mb: usize, threads: usize) -> Self {
        let mut tt = TranspositionTable {
            buckets: Vec::new(),
            generation: AtomicU8::new(0),
        };
        tt.resize(mb, threads);
        tt
    }

    /// Reallocate to `mb` megabytes. Must not race with a search; the
    /// engine façade serializes this with `wait_for_search_finished`.
    pub fn resize(&mut self, mb: usize, threads: usize) {
        let bucket_count = (mb * 1024 * 1024 / mem::size_of::<Bucket>()).max(1);
        self.buckets = Vec::with_capacity(bucket_count);
        // Vec growth would zero sequentially; chunked init keeps large
        // tables fast by spreading the work over the worker count.
        self.buckets.resize_with(bucket_count, Bucket::new);
        let threads = threads.max(1);
        if threads > 1 {
            let chunk = bucket_count.div_ceil(threads);
            std::thread::scope(|s| {
                for part in self.buckets.chunks(chunk) {
                    s.spawn(move || {
                        for bucket in part {
                            for slot in &bucket.slots {
                                slot.clear();
                            }
                        }
                    });
                }
            });
        }
        self.generation.store(0, Ordering::Relaxed);
    }

    /// Allocated size in megabytes, rounded back up to the requested size.
    #[must_use]
    pub fn capacity_mb(&self) -> usize {
        (self.buckets.len() * mem::size_of::<Bucket>()).div_ceil(1024 * 1024)
    }

    /// Advance the generation counter; called once per root search.
    pub fn new_search(&self) {
        let g = self.generation.load(Ordering::Relaxed);
        self.generation.store((g + 1) % GENERATION_CYCLE, Ordering::Relaxed);
    }

    #[must_use]
    pub fn generation(&self) -> u8 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Clear all entries using up to `threads` helpers.
    pub fn clear(&self, threads: usize) {
        let threads = threads.max(1);
        let chunk = self.buckets.len().div_ceil(threads);
        std::thread::scope(|s| {
            for part in self.buckets.chunks(chunk) {
                s.spawn(move || {
                    for bucket in part {
                        for slot in &bucket.slots {
                            slot.clear();
                        }
                    }
                });
            }
        });
        self.generation.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn bucket_index(&self, key: u64) -> usize {
        // Multiply-high maps the key uniformly onto [0, len) without
        // requiring a power-of-two size.
        ((u128::from(key) * self.buckets.len() as u128) >> 64) as usize
    }

    /// Probe for `key`. Returns the matching snapshot (if any) and a writer
    /// handle addressing the same bucket.
    #[must_use]
    pub fn probe(&self, key: u64) -> (Option<TTData>, TTWriter) {
        let idx = self.bucket_index(key);
        let writer = TTWriter { bucket: idx };
        for slot in &self.buckets[idx].slots {
            if let Some(data) = slot.load(key) {
                // Refresh the age so a hit entry survives replacement.
                let current = self.generation();
                if generation_of(data) != current {
                    let refreshed = data & !(0x1F_u64 << 59) | u64::from(current) << 59;
                    slot.store(key, refreshed);
                }
                return (Some(unpack(data)), writer);
            }
        }
        (None, writer)
    }

    /// Commit an entry into the probed bucket. An existing entry for the
    /// same key is overwritten in place, keeping its move when the newcomer
    /// has none; otherwise the replacement slot is the one minimizing
    /// `depth - 8 * age`.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        writer: TTWriter,
        key: u64,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Option<Move>,
        eval: Value,
    ) {
        let generation = self.generation();
        let bucket = &self.buckets[writer.bucket];

        let mut replace = &bucket.slots[0];
        let mut replace_rank = i32::MAX;
        for slot in &bucket.slots {
            if let Some(existing) = slot.load(key) {
                // Same position: keep the stored move if we have none, and
                // do not let a much shallower bound clobber a deep entry
                // unless it is exact.
                let old = unpack(existing);
                if bound != Bound::Exact
                    && depth + 4 < old.depth
                    && generation_of(existing) == generation
                {
                    return;
                }
                let mv = mv.or(old.mv);
                slot.store(key, pack(mv, value, eval, depth, bound, is_pv, generation));
                return;
            }
            let raw = slot.raw();
            let age = i32::from((GENERATION_CYCLE + generation - generation_of(raw)) % GENERATION_CYCLE);
            let rank = if raw == 0 { i32::MIN } else { depth8_of(raw) - 8 * age };
            if rank < replace_rank {
                replace_rank = rank;
                replace = slot;
            }
        }
        replace.store(key, pack(mv, value, eval, depth, bound, is_pv, generation));
    }

    /// Per-mille occupancy of entries at most `max_age` generations old,
    /// sampled over the first 1000 buckets.
    #[must_use]
    pub fn hashfull(&self, max_age: u8) -> u32 {
        let generation = self.generation();
        let sample = self.buckets.len().min(1000);
        let mut filled = 0u32;
        for bucket in &self.buckets[..sample] {
            for slot in &bucket.slots {
                let raw = slot.raw();
                let age = (GENERATION_CYCLE + generation - generation_of(raw)) % GENERATION_CYCLE;
                if raw != 0 && age <= max_age {
                    filled += 1;
                }
            }
        }
        filled * 1000 / (sample as u32 * CLUSTER_SIZE as u32)
    }
}

// ----------------------------------------------------------------------
// Mate/TB score translation: stored values are plies from the *current*
// node so that entries are reusable from other paths.
// ----------------------------------------------------------------------

/// Convert a search value into its TT encoding at `ply`.
#[must_use]
pub fn value_to_tt(v: Value, ply: i32) -> Value {
    debug_assert!(v != VALUE_NONE);
    if is_win(v) {
        v + ply
    } else if is_loss(v) {
        v - ply
    } else {
        v
    }
}

/// Inverse of `value_to_tt`. Mate/TB scores that could be false due to an
/// imminent 50-move draw are downgraded to just inside the decisive range.
#[must_use]
pub fn value_from_tt(v: Value, ply: i32, rule50: u32) -> Value {
    use crate::types::{VALUE_MATE, VALUE_MATE_IN_MAX_PLY, VALUE_TB};
    if v == VALUE_NONE {
        return VALUE_NONE;
    }
    let budget = 100 - rule50 as i32;
    if is_win(v) {
        // Downgrade a mate/TB claim that cannot be converted before the
        // 50-move counter runs out; it may be stale.
        if v >= VALUE_MATE_IN_MAX_PLY && VALUE_MATE - v > budget {
            return VALUE_TB_WIN_IN_MAX_PLY - 1;
        }
        if v < VALUE_MATE_IN_MAX_PLY && VALUE_TB - v > budget {
            return VALUE_TB_WIN_IN_MAX_PLY - 1;
        }
        return v - ply;
    }
    if is_loss(v) {
        if v <= -VALUE_MATE_IN_MAX_PLY && VALUE_MATE + v > budget {
            return VALUE_TB_LOSS_IN_MAX_PLY + 1;
        }
        if v > -VALUE_MATE_IN_MAX_PLY && VALUE_TB + v > budget {
            return VALUE_TB_LOSS_IN_MAX_PLY + 1;
        }
        return v + ply;
    }
    v
}

/// Helper used for the draw-blindness jitter: not all draws are equal.
#[must_use]
pub fn value_draw(nodes: u64) -> Value {
    crate::types::VALUE_DRAW - 1 + (nodes & 0x2) as Value
}

#[cfg(test)]
mod tests {
    use super::*;
    use cozy_chess::Piece;
    use proptest::prelude::*;

    fn mv(from: Square, to: Square, promotion: Option<Piece>) -> Move {
        Move { from, to, promotion }
    }

    #[test]
    fn pack_round_trip() {
        let m = mv(Square::E2, Square::E4, None);
        let packed = pack(Some(m), 120, -44, 17, Bound::Lower, true, 9);
        let data = unpack(packed);
        assert_eq!(data.mv, Some(m));
        assert_eq!(data.value, 120);
        assert_eq!(data.eval, -44);
        assert_eq!(data.depth, 17);
        assert_eq!(data.bound, Bound::Lower);
        assert!(data.is_pv);
        assert_eq!(generation_of(packed), 9);
    }

    #[test]
    fn store_then_probe_hits() {
        let tt = TranspositionTable::new(1, 1);
        let key = 0x1234_5678_9ABC_DEF0;
        let m = mv(Square::G1, Square::F3, None);

        let (miss, writer) = tt.probe(key);
        assert!(miss.is_none());
        tt.write(writer, key, 55, false, Bound::Exact, 9, Some(m), 42);

        let (hit, _) = tt.probe(key);
        let data = hit.expect("entry written");
        assert_eq!(data.mv, Some(m));
        assert_eq!(data.value, 55);
        assert_eq!(data.eval, 42);
        assert_eq!(data.depth, 9);
        assert_eq!(data.bound, Bound::Exact);
    }

    #[test]
    fn different_key_is_a_miss() {
        let tt = TranspositionTable::new(1, 1);
        let (_, writer) = tt.probe(1);
        tt.write(writer, 1, 10, false, Bound::Lower, 5, None, 0);
        assert!(tt.probe(2).0.is_none());
    }

    #[test]
    fn rewrite_preserves_move_when_new_move_is_none() {
        let tt = TranspositionTable::new(1, 1);
        let key = 77;
        let m = mv(Square::D2, Square::D4, None);
        let (_, writer) = tt.probe(key);
        tt.write(writer, key, 10, false, Bound::Lower, 5, Some(m), 0);
        tt.write(writer, key, 20, false, Bound::Exact, 6, None, 0);
        let (hit, _) = tt.probe(key);
        assert_eq!(hit.unwrap().mv, Some(m));
        assert_eq!(hit.unwrap().depth, 6);
    }

    #[test]
    fn hashfull_counts_current_generation() {
        let tt = TranspositionTable::new(1, 1);
        assert_eq!(tt.hashfull(0), 0);
        for key in 0..3000u64 {
            let spread = key.wrapping_mul(0x9e37_79b9_7f4a_7c15);
            let (_, w) = tt.probe(spread);
            tt.write(w, spread, 0, false, Bound::Exact, 4, None, 0);
        }
        assert!(tt.hashfull(0) > 0);
        // Aged-out entries only count when the caller widens the window.
        tt.new_search();
        assert_eq!(tt.hashfull(0), 0);
        assert!(tt.hashfull(1) > 0);
    }

    #[test]
    fn capacity_reports_the_requested_size() {
        assert_eq!(TranspositionTable::new(1, 1).capacity_mb(), 1);
        assert_eq!(TranspositionTable::new(4, 1).capacity_mb(), 4);
        assert_eq!(TranspositionTable::new(16, 1).capacity_mb(), 16);
    }

    #[test]
    fn clear_empties_table() {
        let tt = TranspositionTable::new(1, 2);
        let (_, w) = tt.probe(99);
        tt.write(w, 99, 1, false, Bound::Exact, 3, None, 0);
        tt.clear(2);
        assert!(tt.probe(99).0.is_none());
    }

    #[test]
    fn mate_scores_are_ply_relative() {
        use crate::types::mate_in;
        let v = mate_in(8);
        let stored = value_to_tt(v, 3);
        // From a node 5 plies deep on another path the mate is re-anchored.
        assert_eq!(value_from_tt(stored, 5, 0), v + 3 - 5);
    }

    proptest! {
        #[test]
        fn tt_value_round_trip(v in -28000i32..28000, ply in 0i32..200) {
            // Non-mate, non-TB scores must round-trip exactly.
            prop_assume!(!is_decisive(v));
            prop_assert_eq!(value_from_tt(value_to_tt(v, ply), ply, 0), v);
        }

        #[test]
        fn move_encoding_round_trip(from in 0usize..64, to in 0usize..64, promo in 0usize..5) {
            let m = Move {
                from: Square::index_const(from),
                to: Square::index_const(to),
                promotion: if promo == 0 { None } else { Some(Piece::index_const(promo - 1)) },
            };
            prop_assert_eq!(move_from_u16(move_to_u16(m)), m);
        }
    }
}
