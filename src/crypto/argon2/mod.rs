//! Argon2 (RFC 9106, version 0x13) memory-hard key derivation.
//!
//! The memory matrix is filled slice by slice. Within a slice the lanes'
//! segments are shared out over a bounded set of scoped workers; the scope
//! join at the end of each slice is the synchronization barrier between
//! slices.

mod block;
mod segment;

use std::num::NonZero;
use std::thread;

use blake2::Blake2bVar;
use blake2::digest::{Update, VariableOutput};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

pub use self::block::{BLOCK_BYTES, Block};
pub use self::segment::{Position, SYNC_POINTS};
use self::segment::{Geometry, SliceView};
use crate::error::{Error, Result};

pub const VERSION: u32 = 0x13;
pub const MIN_SALT_LEN: usize = 8;
pub const MIN_OUTPUT_LEN: usize = 4;
pub const MAX_LANES: u32 = 0x00ff_ffff;
/// Upper bound on fill workers, whatever the lane count.
pub const MAX_THREADS: u32 = 256;
/// Worker count used when the available parallelism cannot be detected.
const DEFAULT_THREADS: u32 = 4;

/// Workers used for `lanes` lanes when no count is requested: one per lane,
/// limited to the parallelism the host reports.
pub fn default_threads(lanes: u32) -> u32 {
    let available = thread::available_parallelism()
        .map(NonZero::get)
        .map_or(DEFAULT_THREADS, |n| u32::try_from(n).unwrap_or(MAX_THREADS));
    lanes.min(available).clamp(1, MAX_THREADS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Data-dependent addressing.
    Argon2d = 0,
    /// Data-independent addressing.
    Argon2i = 1,
    /// Independent for the first half of the first pass, dependent after.
    Argon2id = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    variant: Variant,
    mem_cost_kib: u32,
    passes: u32,
    lanes: u32,
    threads: u32,
}

impl Params {
    /// Uses [`default_threads`] workers unless changed with [`Params::with_threads`].
    pub fn new(variant: Variant, mem_cost_kib: u32, passes: u32, lanes: u32) -> Result<Self> {
        if lanes == 0 || lanes > MAX_LANES {
            return Err(Error::InvalidParams(format!("lane count {lanes} out of range")));
        }
        if passes == 0 {
            return Err(Error::InvalidParams("at least one pass is required".into()));
        }
        if (mem_cost_kib as u64) < 8 * lanes as u64 {
            return Err(Error::InvalidParams(format!(
                "memory cost {mem_cost_kib} KiB is below 8 KiB per lane"
            )));
        }
        Ok(Self {
            variant,
            mem_cost_kib,
            passes,
            lanes,
            threads: default_threads(lanes),
        })
    }

    /// Sets the worker count, clamped to `1..=lanes` and to [`MAX_THREADS`].
    /// Output does not depend on it.
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads.clamp(1, self.lanes.min(MAX_THREADS));
        self
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn lanes(&self) -> u32 {
        self.lanes
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }
}

/// Byte inputs of one derivation.
#[derive(Clone, Copy, Default)]
pub struct Inputs<'a> {
    pub password: &'a [u8],
    pub salt: &'a [u8],
    pub secret: &'a [u8],
    pub associated_data: &'a [u8],
}

/// Derives `out.len()` bytes from `password` and `salt`.
pub fn hash(params: &Params, password: &[u8], salt: &[u8], out: &mut [u8]) -> Result<()> {
    let inputs = Inputs {
        password,
        salt,
        ..Inputs::default()
    };
    hash_inputs(params, &inputs, out)
}

pub fn hash_inputs(params: &Params, inputs: &Inputs<'_>, out: &mut [u8]) -> Result<()> {
    let mut instance = Instance::new(params, inputs, out.len())?;
    instance.fill_memory()?;
    instance.finalize(out)
}

/// The working state of one derivation: geometry plus the memory matrix.
///
/// The matrix is wiped on drop.
pub struct Instance {
    geometry: Geometry,
    threads: u32,
    memory: Vec<Block>,
}

impl Instance {
    /// Validates inputs, allocates the matrix and writes the first two blocks
    /// of every lane.
    pub fn new(params: &Params, inputs: &Inputs<'_>, out_len: usize) -> Result<Self> {
        if out_len < MIN_OUTPUT_LEN || u32::try_from(out_len).is_err() {
            return Err(Error::InvalidParams(format!("output length {out_len} out of range")));
        }
        if inputs.salt.len() < MIN_SALT_LEN {
            return Err(Error::InvalidParams(format!(
                "salt must be at least {MIN_SALT_LEN} bytes"
            )));
        }

        let segment_length = params.mem_cost_kib / (params.lanes * SYNC_POINTS);
        let lane_length = segment_length * SYNC_POINTS;
        let geometry = Geometry {
            variant: params.variant,
            passes: params.passes,
            lanes: params.lanes,
            lane_length,
            segment_length,
            memory_blocks: lane_length * params.lanes,
        };

        let blocks = geometry.memory_blocks as usize;
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(blocks)
            .map_err(|_| Error::Allocation(geometry.memory_blocks as u64))?;
        memory.resize(blocks, Block::ZERO);

        let mut instance = Self {
            geometry,
            threads: params.threads,
            memory,
        };
        let h0 = initial_hash(params, inputs, out_len)?;
        instance.initialize_lanes(&h0)?;
        Ok(instance)
    }

    fn initialize_lanes(&mut self, h0: &[u8; 64]) -> Result<()> {
        let mut buf = Zeroizing::new([0u8; BLOCK_BYTES]);
        for lane in 0..self.geometry.lanes {
            for i in 0..2u32 {
                hash_long(&mut buf[..], &[h0, &i.to_le_bytes(), &lane.to_le_bytes()])?;
                let offset = (lane * self.geometry.lane_length + i) as usize;
                self.memory[offset] = Block::from_bytes(&buf);
            }
        }
        Ok(())
    }

    /// Runs every pass and slice.
    pub fn fill_memory(&mut self) -> Result<()> {
        debug!(
            variant = ?self.geometry.variant,
            blocks = self.geometry.memory_blocks,
            passes = self.geometry.passes,
            lanes = self.geometry.lanes,
            threads = self.threads,
            "filling argon2 memory"
        );
        for pass in 0..self.geometry.passes {
            for slice in 0..SYNC_POINTS {
                self.fill_slice(pass, slice)?;
            }
        }
        Ok(())
    }

    /// Fills a single segment.
    ///
    /// Blocks of other lanes in the same slice are unavailable, so segments
    /// of one slice may be filled in any lane order but slices must be filled
    /// in order.
    pub fn fill_segment(&mut self, position: Position) -> Result<()> {
        self.geometry.check(position)?;
        let geometry = self.geometry;
        let (view, mut segments) = SliceView::split(&mut self.memory, &geometry, position.slice);
        let segment = segments.swap_remove(position.lane as usize);
        segment::fill_segment(&geometry, &view, segment, position)
    }

    fn fill_slice(&mut self, pass: u32, slice: u32) -> Result<()> {
        let geometry = self.geometry;
        let threads = self.threads.clamp(1, geometry.lanes.min(MAX_THREADS)) as usize;
        let (view, segments) = SliceView::split(&mut self.memory, &geometry, slice);
        let mut jobs = segments.into_iter().zip(0u32..);

        if threads == 1 {
            return jobs.try_for_each(|(segment, lane)| {
                segment::fill_segment(&geometry, &view, segment, Position { pass, lane, slice })
            });
        }

        let per_worker = (geometry.lanes as usize).div_ceil(threads);
        thread::scope(|scope| {
            let mut workers = Vec::with_capacity(threads);
            let mut result = Ok(());
            loop {
                let batch: Vec<_> = jobs.by_ref().take(per_worker).collect();
                if batch.is_empty() {
                    break;
                }
                let (view, geometry) = (&view, &geometry);
                let spawned = thread::Builder::new()
                    .name(format!("argon2-fill-{}", workers.len()))
                    .spawn_scoped(scope, move || {
                        batch.into_iter().try_for_each(|(segment, lane)| {
                            segment::fill_segment(geometry, view, segment, Position { pass, lane, slice })
                        })
                    });
                match spawned {
                    Ok(worker) => workers.push(worker),
                    Err(err) => {
                        result = Err(Error::Kdf(format!("cannot start fill worker: {err}")));
                        break;
                    }
                }
            }
            // every worker is joined so a panic never escapes the scope
            for worker in workers {
                let joined = worker
                    .join()
                    .map_err(|_| Error::Kdf("fill worker panicked".into()))
                    .and_then(|filled| filled);
                if result.is_ok() {
                    result = joined;
                }
            }
            result
        })
    }

    /// XORs the last block of every lane and hashes it into `out`.
    pub fn finalize(&self, out: &mut [u8]) -> Result<()> {
        let lane_length = self.geometry.lane_length as usize;
        let mut acc = self.memory[lane_length - 1];
        for lane in 1..self.geometry.lanes as usize {
            acc ^= &self.memory[lane * lane_length + lane_length - 1];
        }
        let bytes = Zeroizing::new(acc.to_bytes());
        acc.zeroize();
        hash_long(out, &[&bytes[..]])
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        for block in self.memory.iter_mut() {
            block.zeroize();
        }
    }
}

fn initial_hash(params: &Params, inputs: &Inputs<'_>, out_len: usize) -> Result<Zeroizing<[u8; 64]>> {
    let le = |n: usize| (n as u32).to_le_bytes();
    let mut h0 = Zeroizing::new([0u8; 64]);
    blake2b(
        &mut h0[..],
        &[
            &params.lanes.to_le_bytes(),
            &le(out_len),
            &params.mem_cost_kib.to_le_bytes(),
            &params.passes.to_le_bytes(),
            &VERSION.to_le_bytes(),
            &(params.variant as u32).to_le_bytes(),
            &le(inputs.password.len()),
            inputs.password,
            &le(inputs.salt.len()),
            inputs.salt,
            &le(inputs.secret.len()),
            inputs.secret,
            &le(inputs.associated_data.len()),
            inputs.associated_data,
        ],
    )?;
    Ok(h0)
}

fn blake2b(out: &mut [u8], inputs: &[&[u8]]) -> Result<()> {
    let mut hasher = Blake2bVar::new(out.len())
        .map_err(|_| Error::Kdf(format!("invalid BLAKE2b output length {}", out.len())))?;
    for input in inputs {
        hasher.update(input);
    }
    hasher
        .finalize_variable(out)
        .map_err(|_| Error::Kdf("BLAKE2b output buffer mismatch".into()))
}

/// Variable-length hash H'.
fn hash_long(out: &mut [u8], inputs: &[&[u8]]) -> Result<()> {
    let len = (out.len() as u32).to_le_bytes();
    let mut prefixed: Vec<&[u8]> = Vec::with_capacity(inputs.len() + 1);
    prefixed.push(&len);
    prefixed.extend_from_slice(inputs);

    if out.len() <= 64 {
        return blake2b(out, &prefixed);
    }

    let mut v = Zeroizing::new([0u8; 64]);
    blake2b(&mut v[..], &prefixed)?;
    out[..32].copy_from_slice(&v[..32]);
    let mut pos = 32;
    while out.len() - pos > 64 {
        let prev = Zeroizing::new(*v);
        blake2b(&mut v[..], &[&prev[..]])?;
        out[pos..pos + 32].copy_from_slice(&v[..32]);
        pos += 32;
    }
    let last = Zeroizing::new(*v);
    blake2b(&mut out[pos..], &[&last[..]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn rfc9106(variant: Variant) -> Vec<u8> {
        let params = Params::new(variant, 32, 3, 4).unwrap();
        let inputs = Inputs {
            password: &[0x01; 32],
            salt: &[0x02; 16],
            secret: &[0x03; 8],
            associated_data: &[0x04; 12],
        };
        let mut out = [0u8; 32];
        hash_inputs(&params, &inputs, &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn rfc9106_argon2d() {
        assert_eq!(
            rfc9106(Variant::Argon2d),
            hex("512b391b6f1162975371d30919734294f868e3be3984f3c1a13a4db9fabe4acb")
        );
    }

    #[test]
    fn rfc9106_argon2i() {
        assert_eq!(
            rfc9106(Variant::Argon2i),
            hex("c814d9d1dc7f37aa13f0d77f2494bda1c8de6b016dd388d29952a4c4672b6ce8")
        );
    }

    #[test]
    fn rfc9106_argon2id() {
        assert_eq!(
            rfc9106(Variant::Argon2id),
            hex("0d640df58d78766c08c037a34a8b53c9d01ef0452d75b65eb52520e96b01e659")
        );
    }

    fn reference(variant: Variant, m: u32, t: u32, p: u32, out_len: usize) -> Vec<u8> {
        let algorithm = match variant {
            Variant::Argon2d => ::argon2::Algorithm::Argon2d,
            Variant::Argon2i => ::argon2::Algorithm::Argon2i,
            Variant::Argon2id => ::argon2::Algorithm::Argon2id,
        };
        let params = ::argon2::Params::new(m, t, p, Some(out_len)).unwrap();
        let argon = ::argon2::Argon2::new(algorithm, ::argon2::Version::V0x13, params);
        let mut out = vec![0u8; out_len];
        argon
            .hash_password_into(b"correct horse", b"battery staple salt", &mut out)
            .unwrap();
        out
    }

    #[test]
    fn matches_reference_implementation() {
        let cases = [(64, 1, 1, 32), (256, 3, 4, 32), (100, 2, 3, 64), (512, 2, 2, 100)];
        for variant in [Variant::Argon2d, Variant::Argon2i, Variant::Argon2id] {
            for (m, t, p, len) in cases {
                let params = Params::new(variant, m, t, p).unwrap();
                let mut out = vec![0u8; len];
                hash(&params, b"correct horse", b"battery staple salt", &mut out).unwrap();
                assert_eq!(out, reference(variant, m, t, p, len), "{variant:?} m={m} t={t} p={p}");
            }
        }
    }

    #[test]
    fn independent_addressing_crosses_address_block_boundary() {
        // 1024 KiB over 2 lanes gives 128-block segments: two address blocks per pass-0 segment
        let params = Params::new(Variant::Argon2i, 1024, 1, 2).unwrap();
        let mut out = [0u8; 32];
        hash(&params, b"correct horse", b"battery staple salt", &mut out).unwrap();
        assert_eq!(out.to_vec(), reference(Variant::Argon2i, 1024, 1, 2, 32));
    }

    #[test]
    fn output_is_independent_of_thread_count() {
        let base = Params::new(Variant::Argon2id, 256, 2, 4).unwrap();
        let mut expected = [0u8; 32];
        hash(&base.with_threads(1), b"pw", b"saltsalt", &mut expected).unwrap();
        for threads in [2, 3, 4, 16] {
            let mut out = [0u8; 32];
            hash(&base.with_threads(threads), b"pw", b"saltsalt", &mut out).unwrap();
            assert_eq!(out, expected, "threads={threads}");
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let params = Params::new(Variant::Argon2d, 64, 2, 2).unwrap();
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        hash(&params, b"pw", b"saltsalt", &mut a).unwrap();
        hash(&params, b"pw", b"saltsalt", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn manual_segment_fill_matches_full_fill() {
        let params = Params::new(Variant::Argon2id, 64, 2, 2).unwrap();
        let inputs = Inputs {
            password: b"pw",
            salt: b"saltsalt",
            ..Inputs::default()
        };

        let mut manual = Instance::new(&params, &inputs, 32).unwrap();
        for pass in 0..2 {
            for slice in 0..SYNC_POINTS {
                for lane in (0..2).rev() {
                    manual.fill_segment(Position { pass, lane, slice }).unwrap();
                }
            }
        }
        let mut a = [0u8; 32];
        manual.finalize(&mut a).unwrap();

        let mut b = [0u8; 32];
        hash_inputs(&params, &inputs, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fill_segment_rejects_invalid_position() {
        let params = Params::new(Variant::Argon2d, 64, 1, 2).unwrap();
        let inputs = Inputs {
            password: b"pw",
            salt: b"saltsalt",
            ..Inputs::default()
        };
        let mut instance = Instance::new(&params, &inputs, 32).unwrap();
        assert!(instance.fill_segment(Position { pass: 1, lane: 0, slice: 0 }).is_err());
        assert!(instance.fill_segment(Position { pass: 0, lane: 2, slice: 0 }).is_err());
        assert!(instance.fill_segment(Position { pass: 0, lane: 0, slice: 4 }).is_err());
    }

    #[test]
    fn invalid_params_fail() {
        assert!(Params::new(Variant::Argon2id, 64, 1, 0).is_err());
        assert!(Params::new(Variant::Argon2id, 64, 0, 1).is_err());
        assert!(Params::new(Variant::Argon2id, 31, 1, 4).is_err());

        let params = Params::new(Variant::Argon2id, 64, 1, 1).unwrap();
        let mut out = [0u8; 32];
        assert!(hash(&params, b"pw", b"short", &mut out).is_err());
        let mut tiny = [0u8; 3];
        assert!(hash(&params, b"pw", b"saltsalt", &mut tiny).is_err());
    }

    #[test]
    fn threads_are_clamped() {
        let params = Params::new(Variant::Argon2id, 64, 1, 2).unwrap();
        assert_eq!(params.with_threads(0).threads(), 1);
        assert_eq!(params.with_threads(9).threads(), 2);
    }

    #[test]
    fn default_workers_are_bounded_by_host() {
        let available = thread::available_parallelism().map_or(DEFAULT_THREADS as usize, NonZero::get);

        let wide = Params::new(Variant::Argon2id, 8 * 40_000, 1, 40_000).unwrap();
        assert!(wide.threads() >= 1);
        assert!(wide.threads() <= MAX_THREADS);
        assert!(wide.threads() as usize <= available);
        assert!(wide.with_threads(u32::MAX).threads() <= MAX_THREADS);

        let narrow = Params::new(Variant::Argon2id, 64, 1, 1).unwrap();
        assert_eq!(narrow.threads(), 1);
    }

    #[test]
    fn many_lanes_fill_with_bounded_workers() {
        // 1024 lanes of 8 blocks each; more lanes than workers
        let params = Params::new(Variant::Argon2id, 8 * 1024, 1, 1024).unwrap();
        assert!(params.threads() < params.lanes());

        let mut out = [0u8; 32];
        hash(&params, b"pw", b"saltsalt", &mut out).unwrap();

        let mut single = [0u8; 32];
        hash(&params.with_threads(1), b"pw", b"saltsalt", &mut single).unwrap();
        assert_eq!(out, single);
    }
}
