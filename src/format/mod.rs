//! Volume header format.
//!
//! Provides version-aware sealing and opening of the 512-byte volume header.
//!
//! ```text
//! SALT (64) | KDF PARAMS (16) | ENCRYPTED REGION (432)
//! ```
//!
//! The cleartext prefix is readable without a credential; the encrypted
//! region is sealed with XTS under the key derived from the credential and
//! its layout depends on the format version it carries.

use std::fmt;

use zeroize::Zeroizing;

use crate::crypto::xts::{self, XtsKeys};
use crate::crypto::{CipherEngine, KEY_AREA_LEN, SALT_LEN};
use crate::error::{Error, Result};
use crate::kdf::{HeaderKey, KdfParams};

pub mod v1;

/// Total header size.
pub const HEADER_LEN: usize = 512;
/// Length of the KDF parameter block.
pub const PARAMS_LEN: usize = 16;
/// Offset of the encrypted region.
pub const ENCRYPTED_OFFSET: usize = SALT_LEN + PARAMS_LEN;
/// Length of the encrypted region.
pub const ENCRYPTED_LEN: usize = HEADER_LEN - ENCRYPTED_OFFSET;
/// Magic bytes at the start of the decrypted region ("VKHD").
pub const MAGIC: &[u8; 4] = b"VKHD";
/// Latest format version.
pub const CURRENT_VERSION: u16 = v1::VERSION_V1;

/// XTS data unit used for the header.
const HEADER_UNIT: u64 = 0;

/// The credential-free prefix of a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleartext {
    pub salt: [u8; SALT_LEN],
    pub kdf: KdfParams,
}

impl Cleartext {
    /// Parses salt and KDF parameters.
    ///
    /// # Errors
    ///
    /// Returns `MalformedHeader` if the buffer is not a full header or the
    /// parameter block is not valid.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(Error::MalformedHeader(format!(
                "expected {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[..SALT_LEN]);
        let kdf = v1::decode_params(&bytes[SALT_LEN..ENCRYPTED_OFFSET])?;
        Ok(Self { salt, kdf })
    }
}

/// A decrypted volume header.
#[derive(Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    version: u16,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    data_size: u64,
    key_area: Zeroizing<[u8; KEY_AREA_LEN]>,
}

impl VolumeHeader {
    pub fn new(
        kdf: KdfParams,
        salt: [u8; SALT_LEN],
        data_size: u64,
        key_area: Zeroizing<[u8; KEY_AREA_LEN]>,
    ) -> Self {
        Self {
            version: CURRENT_VERSION,
            kdf,
            salt,
            data_size,
            key_area,
        }
    }

    /// Same master keys and data size under a new salt and KDF.
    pub fn rewrapped(&self, kdf: KdfParams, salt: [u8; SALT_LEN]) -> Self {
        Self {
            version: CURRENT_VERSION,
            kdf,
            salt,
            data_size: self.data_size,
            key_area: self.key_area.clone(),
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn key_area(&self) -> &[u8; KEY_AREA_LEN] {
        &self.key_area
    }

    /// Seals the header under `key`.
    ///
    /// `key` must have been derived from this header's salt and KDF
    /// parameters, otherwise the result cannot be opened again.
    pub fn seal(&self, engine: &CipherEngine, key: &HeaderKey) -> Result<Zeroizing<[u8; HEADER_LEN]>> {
        let mut out = Zeroizing::new([0u8; HEADER_LEN]);
        out[..SALT_LEN].copy_from_slice(&self.salt);
        out[SALT_LEN..ENCRYPTED_OFFSET].copy_from_slice(&v1::encode_params(&self.kdf));

        let body = match self.version {
            v1::VERSION_V1 => v1::encode_body(self),
            v => return Err(Error::MalformedHeader(format!("unsupported version {v}"))),
        };
        out[ENCRYPTED_OFFSET..].copy_from_slice(&body[..]);

        let keys = XtsKeys::new(engine, key.as_bytes())?;
        xts::encrypt(&keys, HEADER_UNIT, &mut out[ENCRYPTED_OFFSET..])?;
        Ok(out)
    }

    /// Opens a sealed header with an already derived key.
    ///
    /// # Errors
    ///
    /// Returns `WrongCredential` when the decrypted region does not carry the
    /// magic or its checksums do not match, and `MalformedHeader` for an
    /// unknown format version.
    pub fn open(engine: &CipherEngine, key: &HeaderKey, bytes: &[u8]) -> Result<Self> {
        let cleartext = Cleartext::parse(bytes)?;

        let mut body = Zeroizing::new([0u8; ENCRYPTED_LEN]);
        body.copy_from_slice(&bytes[ENCRYPTED_OFFSET..]);
        let keys = XtsKeys::new(engine, key.as_bytes())?;
        xts::decrypt(&keys, HEADER_UNIT, &mut body[..])?;

        if &body[..MAGIC.len()] != MAGIC {
            return Err(Error::WrongCredential);
        }
        let version = u16::from_le_bytes([body[4], body[5]]);
        match version {
            v1::VERSION_V1 => v1::decode_body(&body, cleartext),
            v => Err(Error::MalformedHeader(format!("unsupported version {v}"))),
        }
    }
}

impl fmt::Debug for VolumeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeHeader")
            .field("version", &self.version)
            .field("kdf", &self.kdf)
            .field("data_size", &self.data_size)
            .field("key_area", &"[REDACTED]")
            .finish()
    }
}
