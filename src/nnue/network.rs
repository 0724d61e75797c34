//! Network container: weights, feedforward, and the binary file format.
//!
//! The file layout is a 32-bit architecture hash followed by per-section
//! blocks, each led by its own 32-bit hash: the feature transformer
//! (16-bit biases and weights, 32-bit PSQT head), then the affine stack
//! (32-bit biases, signed 8-bit weights). Hashes are derived from the
//! layer dimensions and verified on load.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::types::Value;

/// King-placement buckets of the feature set.
pub const KING_BUCKETS: usize = 4;
/// Input features: bucket x (piece type, piece color) x square.
pub const FEATURES: usize = KING_BUCKETS * 12 * 64;
/// Width of the two hidden affine layers.
pub const FC_OUT: usize = 16;
/// Activation ceiling for the clipped ReLU.
pub const QA: i32 = 127;
/// Post-affine activations are rescaled by this shift before clipping.
pub const SHIFT: i32 = 6;

/// Hidden size of the large subnet (full positions).
pub const BIG_H: usize = 128;
/// Hidden size of the small subnet (lopsided or simple positions).
pub const SMALL_H: usize = 64;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network hash mismatch in {section}: expected {expected:#010x}, found {found:#010x}")]
    HashMismatch {
        section: &'static str,
        expected: u32,
        found: u32,
    },
}

/// FNV-1a over the architecture dimensions; stable across builds.
const fn fnv(mut h: u32, v: u32) -> u32 {
    let bytes = v.to_le_bytes();
    let mut i = 0;
    while i < 4 {
        h ^= bytes[i] as u32;
        h = h.wrapping_mul(0x0100_0193);
        i += 1;
    }
    h
}

const FNV_BASIS: u32 = 0x811c_9dc5;

const fn transformer_hash(hidden: usize) -> u32 {
    fnv(fnv(FNV_BASIS, FEATURES as u32), hidden as u32)
}

const fn stack_hash(hidden: usize) -> u32 {
    fnv(fnv(fnv(FNV_BASIS, 2 * hidden as u32), FC_OUT as u32), 1)
}

const fn arch_hash(hidden: usize) -> u32 {
    fnv(transformer_hash(hidden), stack_hash(hidden))
}

/// One subnet: feature transformer plus a three-affine stack with clipped
/// ReLU between, and a PSQT head summed directly from the features.
#[derive(Clone, Debug)]
pub struct Network<const H: usize> {
    pub ft_weights: Vec<i16>,   // FEATURES * H
    pub ft_bias: Vec<i16>,      // H
    pub psqt_weights: Vec<i32>, // FEATURES
    pub fc1_w: Vec<i8>,         // FC_OUT * 2H
    pub fc1_b: Vec<i32>,        // FC_OUT
    pub fc2_w: Vec<i8>,         // FC_OUT * FC_OUT
    pub fc2_b: Vec<i32>,        // FC_OUT
    pub out_w: Vec<i8>,         // FC_OUT
    pub out_b: i32,
}

impl<const H: usize> Network<H> {
    pub const ARCH_HASH: u32 = arch_hash(H);

    /// All-zero network. Useless on its own; the engine fills in the
    /// material baseline or file contents.
    #[must_use]
    pub fn zeroed() -> Self {
        Network {
            ft_weights: vec![0; FEATURES * H],
            ft_bias: vec![0; H],
            psqt_weights: vec![0; FEATURES],
            fc1_w: vec![0; FC_OUT * 2 * H],
            fc1_b: vec![0; FC_OUT],
            fc2_w: vec![0; FC_OUT * FC_OUT],
            fc2_b: vec![0; FC_OUT],
            out_w: vec![0; FC_OUT],
            out_b: 0,
        }
    }

    /// Built-in fallback: the PSQT head encodes plain material so the
    /// engine searches sensibly before a real network file is loaded.
    #[must_use]
    pub fn material_baseline() -> Self {
        use cozy_chess::Piece;
        let mut net = Self::zeroed();
        for bucket in 0..KING_BUCKETS {
            for (pi, piece) in [Piece::Pawn, Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen, Piece::King]
                .into_iter()
                .enumerate()
            {
                let value = crate::types::piece_value(piece);
                for own in [true, false] {
                    let piece_idx = pi * 2 + usize::from(!own);
                    let sign = if own { 1 } else { -1 };
                    for sq in 0..64 {
                        net.psqt_weights[(bucket * 12 + piece_idx) * 64 + sq] = sign * value;
                    }
                }
            }
        }
        net
    }

    /// Run the affine stack over the concatenated clipped perspectives
    /// (`us` first). Returns the positional part of the evaluation.
    #[must_use]
    pub fn forward(&self, us: &[i16; H], them: &[i16; H]) -> Value {
        let mut input = [0u8; 512]; // 2 * H <= 512 for both subnets
        for (i, &v) in us.iter().enumerate() {
            input[i] = i32::from(v).clamp(0, QA) as u8;
        }
        for (i, &v) in them.iter().enumerate() {
            input[H + i] = i32::from(v).clamp(0, QA) as u8;
        }

        let mut hidden1 = [0u8; FC_OUT];
        for o in 0..FC_OUT {
            let mut sum = self.fc1_b[o];
            let row = &self.fc1_w[o * 2 * H..(o + 1) * 2 * H];
            for i in 0..2 * H {
                sum += i32::from(row[i]) * i32::from(input[i]);
            }
            hidden1[o] = (sum >> SHIFT).clamp(0, QA) as u8;
        }

        let mut hidden2 = [0u8; FC_OUT];
        for o in 0..FC_OUT {
            let mut sum = self.fc2_b[o];
            let row = &self.fc2_w[o * FC_OUT..(o + 1) * FC_OUT];
            for i in 0..FC_OUT {
                sum += i32::from(row[i]) * i32::from(hidden1[i]);
            }
            hidden2[o] = (sum >> SHIFT).clamp(0, QA) as u8;
        }

        let mut sum = self.out_b;
        for i in 0..FC_OUT {
            sum += i32::from(self.out_w[i]) * i32::from(hidden2[i]);
        }
        sum / FC_OUT as i32
    }

    /// Load from the container format, verifying every section hash.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NetworkError> {
        let file = File::open(path)?;
        let mut r = BufReader::new(file);

        check_hash(&mut r, "architecture", Self::ARCH_HASH)?;
        check_hash(&mut r, "feature transformer", transformer_hash(H))?;

        let mut net = Self::zeroed();
        read_i16s(&mut r, &mut net.ft_bias)?;
        read_i16s(&mut r, &mut net.ft_weights)?;
        read_i32s(&mut r, &mut net.psqt_weights)?;

        check_hash(&mut r, "layer stack", stack_hash(H))?;
        read_i32s(&mut r, &mut net.fc1_b)?;
        read_i8s(&mut r, &mut net.fc1_w)?;
        read_i32s(&mut r, &mut net.fc2_b)?;
        read_i8s(&mut r, &mut net.fc2_w)?;
        let mut out_b = [0i32; 1];
        read_i32s(&mut r, &mut out_b)?;
        net.out_b = out_b[0];
        read_i8s(&mut r, &mut net.out_w)?;
        Ok(net)
    }

    /// Write the container format. `save` then `load` is the identity.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), NetworkError> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);

        w.write_all(&Self::ARCH_HASH.to_le_bytes())?;
        w.write_all(&transformer_hash(H).to_le_bytes())?;
        write_i16s(&mut w, &self.ft_bias)?;
        write_i16s(&mut w, &self.ft_weights)?;
        write_i32s(&mut w, &self.psqt_weights)?;

        w.write_all(&stack_hash(H).to_le_bytes())?;
        write_i32s(&mut w, &self.fc1_b)?;
        write_i8s(&mut w, &self.fc1_w)?;
        write_i32s(&mut w, &self.fc2_b)?;
        write_i8s(&mut w, &self.fc2_w)?;
        write_i32s(&mut w, &[self.out_b])?;
        write_i8s(&mut w, &self.out_w)?;
        w.flush()?;
        Ok(())
    }
}

fn check_hash<R: Read>(r: &mut R, section: &'static str, expected: u32) -> Result<(), NetworkError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let found = u32::from_le_bytes(buf);
    if found != expected {
        return Err(NetworkError::HashMismatch {
            section,
            expected,
            found,
        });
    }
    Ok(())
}

fn read_i16s<R: Read>(r: &mut R, out: &mut [i16]) -> std::io::Result<()> {
    let mut buf = [0u8; 2];
    for v in out {
        r.read_exact(&mut buf)?;
        *v = i16::from_le_bytes(buf);
    }
    Ok(())
}

fn read_i32s<R: Read>(r: &mut R, out: &mut [i32]) -> std::io::Result<()> {
    let mut buf = [0u8; 4];
    for v in out {
        r.read_exact(&mut buf)?;
        *v = i32::from_le_bytes(buf);
    }
    Ok(())
}

fn read_i8s<R: Read>(r: &mut R, out: &mut [i8]) -> std::io::Result<()> {
    let mut buf = [0u8; 1];
    for v in out {
        r.read_exact(&mut buf)?;
        *v = buf[0] as i8;
    }
    Ok(())
}

fn write_i16s<W: Write>(w: &mut W, data: &[i16]) -> std::io::Result<()> {
    for v in data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn write_i32s<W: Write>(w: &mut W, data: &[i32]) -> std::io::Result<()> {
    for v in data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn write_i8s<W: Write>(w: &mut W, data: &[i8]) -> std::io::Result<()> {
    for v in data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_hashes_differ_between_subnets() {
        assert_ne!(Network::<BIG_H>::ARCH_HASH, Network::<SMALL_H>::ARCH_HASH);
    }

    #[test]
    fn save_load_round_trips_bytes() {
        let dir = std::env::temp_dir();
        let path_a = dir.join("cinder_net_a.nnue");
        let path_b = dir.join("cinder_net_b.nnue");

        let mut net = Network::<SMALL_H>::material_baseline();
        net.ft_bias[3] = -77;
        net.fc1_w[19] = 5;
        net.out_b = 1234;
        net.save(&path_a).unwrap();

        let loaded = Network::<SMALL_H>::load(&path_a).unwrap();
        loaded.save(&path_b).unwrap();

        let a = std::fs::read(&path_a).unwrap();
        let b = std::fs::read(&path_b).unwrap();
        assert_eq!(a, b);
        let _ = std::fs::remove_file(path_a);
        let _ = std::fs::remove_file(path_b);
    }

    #[test]
    fn wrong_architecture_is_rejected() {
        let dir = std::env::temp_dir();
        let path = dir.join("cinder_net_wrong_arch.nnue");
        Network::<SMALL_H>::material_baseline().save(&path).unwrap();
        let err = Network::<BIG_H>::load(&path).unwrap_err();
        assert!(matches!(err, NetworkError::HashMismatch { section: "architecture", .. }));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn truncated_file_is_an_io_error() {
        let dir = std::env::temp_dir();
        let path = dir.join("cinder_net_truncated.nnue");
        std::fs::write(&path, Network::<SMALL_H>::ARCH_HASH.to_le_bytes()).unwrap();
        assert!(matches!(Network::<SMALL_H>::load(&path), Err(NetworkError::Io(_))));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn zero_network_forwards_to_zero() {
        let net = Network::<SMALL_H>::zeroed();
        let us = [0i16; SMALL_H];
        let them = [0i16; SMALL_H];
        assert_eq!(net.forward(&us, &them), 0);
    }
}
