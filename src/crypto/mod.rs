//! Cryptographic primitives for volume headers.
//!
//! Provides the AES block engine, Argon2 key derivation, keyfile mixing and
//! the XTS sealing used for the header's encrypted region.

pub mod aes;
pub mod argon2;
pub mod crc32;
pub mod keyfile;
pub mod xts;

pub use aes::{Backend, CipherEngine, CpuFeatures, Direction, RoundKeySchedule};
pub use keyfile::{Keyfile, apply_keyfiles};

/// Length of the header salt (64 bytes).
pub const SALT_LEN: usize = 64;
/// Length of the derived header key (two AES-256 keys for XTS).
pub const HEADER_KEY_LEN: usize = 64;
/// Length of the master key area carried inside the header.
pub const KEY_AREA_LEN: usize = 256;
