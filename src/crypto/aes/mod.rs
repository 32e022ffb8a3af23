//! AES block engine with AES-NI / portable dispatch.
//!
//! The backend is chosen once from [`CpuFeatures`] when a [`CipherEngine`] is
//! built. Both backends consume the same [`RoundKeySchedule`] and produce
//! identical output, so ciphertext written on one host opens on any other.

#[cfg(target_arch = "x86_64")]
mod ni;
mod soft;

use serde::Serialize;
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// AES block size in bytes.
pub const BLOCK_LEN: usize = 16;
/// Round keys stored by a schedule regardless of key size (AES-256 needs 15).
pub const MAX_ROUND_KEYS: usize = 15;
/// Serialized schedule: 60 round-key words followed by a 4-byte info field.
pub const SCHEDULE_LEN: usize = MAX_ROUND_KEYS * BLOCK_LEN + 4;

/// Returns `true` when the running CPU can take the AES-NI path.
///
/// std caches the underlying CPUID query, so repeated calls are cheap.
pub fn detect_capability() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("aes") && is_x86_feature_detected!("sse2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// CPU capabilities relevant to the cipher engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    aes_ni: bool,
}

impl CpuFeatures {
    pub fn detect() -> Self {
        Self {
            aes_ni: detect_capability(),
        }
    }

    /// No acceleration; forces the portable path.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn aes_ni(&self) -> bool {
        self.aes_ni
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Software,
    AesNi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Expanded AES key.
///
/// Encrypt schedules hold round keys in application order. Decrypt schedules
/// hold them reversed, with InvMixColumns applied to the inner keys, which is
/// the form both `aesdec` and the portable equivalent inverse cipher expect.
#[derive(Clone)]
pub struct RoundKeySchedule {
    direction: Direction,
    rounds: u8,
    keys: [[u8; BLOCK_LEN]; MAX_ROUND_KEYS],
}

impl RoundKeySchedule {
    pub fn encrypt(key: &[u8]) -> Result<Self> {
        let (keys, rounds) = expand_key(key)?;
        Ok(Self {
            direction: Direction::Encrypt,
            rounds,
            keys,
        })
    }

    pub fn decrypt(key: &[u8]) -> Result<Self> {
        let (mut enc, rounds) = expand_key(key)?;
        let n = rounds as usize;
        let mut keys = [[0u8; BLOCK_LEN]; MAX_ROUND_KEYS];
        for (i, slot) in keys.iter_mut().take(n + 1).enumerate() {
            *slot = enc[n - i];
            if i != 0 && i != n {
                soft::inv_mix_columns(slot);
            }
        }
        enc.zeroize();
        Ok(Self {
            direction: Direction::Decrypt,
            rounds,
            keys,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn rounds(&self) -> usize {
        self.rounds as usize
    }

    pub fn round_key(&self, index: usize) -> Option<&[u8; BLOCK_LEN]> {
        self.keys[..=self.rounds()].get(index)
    }

    /// Serializes to the fixed layout: round keys as little-endian words,
    /// then `rounds * 16` in the first info byte.
    pub fn to_bytes(&self) -> [u8; SCHEDULE_LEN] {
        let mut out = [0u8; SCHEDULE_LEN];
        for (chunk, key) in out.chunks_exact_mut(BLOCK_LEN).zip(&self.keys) {
            chunk.copy_from_slice(key);
        }
        out[MAX_ROUND_KEYS * BLOCK_LEN] = self.rounds * 16;
        out
    }

    /// Parses a serialized schedule. The rounds field is never guessed: a zero
    /// or unknown value is reported as corruption.
    pub fn from_bytes(direction: Direction, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SCHEDULE_LEN {
            return Err(Error::CorruptSchedule(format!(
                "expected {SCHEDULE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let rounds = match bytes[MAX_ROUND_KEYS * BLOCK_LEN] {
            160 => 10,
            192 => 12,
            224 => 14,
            0 => return Err(Error::CorruptSchedule("rounds field is zero".into())),
            other => {
                return Err(Error::CorruptSchedule(format!(
                    "unsupported rounds field {other}"
                )));
            }
        };
        let mut keys = [[0u8; BLOCK_LEN]; MAX_ROUND_KEYS];
        for (key, chunk) in keys.iter_mut().zip(bytes.chunks_exact(BLOCK_LEN)) {
            key.copy_from_slice(chunk);
        }
        Ok(Self {
            direction,
            rounds,
            keys,
        })
    }

    fn require(&self, direction: Direction) -> Result<()> {
        if self.direction != direction {
            return Err(Error::CorruptSchedule(format!(
                "{:?} schedule used for {direction:?}",
                self.direction
            )));
        }
        Ok(())
    }
}

impl Drop for RoundKeySchedule {
    fn drop(&mut self) {
        self.keys.zeroize();
    }
}

impl std::fmt::Debug for RoundKeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundKeySchedule")
            .field("direction", &self.direction)
            .field("rounds", &self.rounds)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

fn expand_key(key: &[u8]) -> Result<([[u8; BLOCK_LEN]; MAX_ROUND_KEYS], u8)> {
    let nk = match key.len() {
        16 => 4,
        24 => 6,
        32 => 8,
        n => return Err(Error::InvalidKeyLength(n)),
    };
    let rounds = nk + 6;
    let total = 4 * (rounds + 1);

    let mut w = [[0u8; 4]; 4 * MAX_ROUND_KEYS];
    for (i, word) in w.iter_mut().take(nk).enumerate() {
        word.copy_from_slice(&key[4 * i..4 * i + 4]);
    }

    let mut rcon = 1u8;
    for i in nk..total {
        let mut t = w[i - 1];
        if i % nk == 0 {
            t.rotate_left(1);
            for b in &mut t {
                *b = soft::SBOX[*b as usize];
            }
            t[0] ^= rcon;
            rcon = soft::next_rcon(rcon);
        } else if nk > 6 && i % nk == 4 {
            for b in &mut t {
                *b = soft::SBOX[*b as usize];
            }
        }
        for j in 0..4 {
            w[i][j] = w[i - nk][j] ^ t[j];
        }
    }

    let mut keys = [[0u8; BLOCK_LEN]; MAX_ROUND_KEYS];
    for (key, words) in keys.iter_mut().zip(w.chunks_exact(4)).take(rounds + 1) {
        for (dst, word) in key.chunks_exact_mut(4).zip(words) {
            dst.copy_from_slice(word);
        }
    }
    w.zeroize();

    Ok((keys, rounds as u8))
}

/// Stateless block transformer. Safe to share across threads; each call
/// works on its own buffer against a read-only schedule.
#[derive(Debug, Clone, Copy)]
pub struct CipherEngine {
    backend: Backend,
}

impl CipherEngine {
    pub fn new(features: CpuFeatures) -> Self {
        let backend = if features.aes_ni() && cfg!(target_arch = "x86_64") {
            Backend::AesNi
        } else {
            Backend::Software
        };
        debug!(?backend, "cipher engine backend selected");
        Self { backend }
    }

    pub fn software() -> Self {
        Self {
            backend: Backend::Software,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn encrypt_block(&self, schedule: &RoundKeySchedule, block: &mut [u8; BLOCK_LEN]) -> Result<()> {
        self.encrypt_blocks(schedule, block)
    }

    pub fn decrypt_block(&self, schedule: &RoundKeySchedule, block: &mut [u8; BLOCK_LEN]) -> Result<()> {
        self.decrypt_blocks(schedule, block)
    }

    /// Encrypts each 16-byte block of `data` independently (no chaining).
    pub fn encrypt_blocks(&self, schedule: &RoundKeySchedule, data: &mut [u8]) -> Result<()> {
        schedule.require(Direction::Encrypt)?;
        check_len(data)?;
        self.encrypt_checked(schedule, data);
        Ok(())
    }

    /// Decrypts each 16-byte block of `data` independently (no chaining).
    pub fn decrypt_blocks(&self, schedule: &RoundKeySchedule, data: &mut [u8]) -> Result<()> {
        schedule.require(Direction::Decrypt)?;
        check_len(data)?;
        self.decrypt_checked(schedule, data);
        Ok(())
    }

    /// Caller guarantees an encrypt schedule and a whole number of blocks.
    pub(super) fn encrypt_checked(&self, schedule: &RoundKeySchedule, data: &mut [u8]) {
        debug_assert_eq!(schedule.direction, Direction::Encrypt);
        debug_assert_eq!(data.len() % BLOCK_LEN, 0);
        let rounds = schedule.rounds();
        match self.backend {
            #[cfg(target_arch = "x86_64")]
            Backend::AesNi => {
                // SAFETY: the AesNi backend is only selected when the CPU reports
                // AES-NI, the schedule holds rounds + 1 keys and the length is a
                // multiple of the block size.
                unsafe { ni::encrypt_blocks(&schedule.keys, rounds, data) }
            }
            _ => soft::encrypt_blocks(&schedule.keys, rounds, data),
        }
    }

    /// Caller guarantees a decrypt schedule and a whole number of blocks.
    pub(super) fn decrypt_checked(&self, schedule: &RoundKeySchedule, data: &mut [u8]) {
        debug_assert_eq!(schedule.direction, Direction::Decrypt);
        debug_assert_eq!(data.len() % BLOCK_LEN, 0);
        let rounds = schedule.rounds();
        match self.backend {
            #[cfg(target_arch = "x86_64")]
            Backend::AesNi => {
                // SAFETY: see `encrypt_checked`.
                unsafe { ni::decrypt_blocks(&schedule.keys, rounds, data) }
            }
            _ => soft::decrypt_blocks(&schedule.keys, rounds, data),
        }
    }
}

fn check_len(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_LEN != 0 {
        return Err(Error::InvalidLength(data.len()));
    }
    Ok(())
}
