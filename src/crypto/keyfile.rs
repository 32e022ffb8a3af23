//! Keyfile mixing.
//!
//! Each keyfile is run through CRC-32 and the running register is folded into
//! a fixed-size pool at a write position shared by all keyfiles. The pool is
//! then added into the password bytes. The result depends on keyfile order.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use zeroize::Zeroizing;

use super::crc32;
use crate::error::{Error, Result};

/// Pool size for passwords up to 64 bytes.
pub const POOL_LEN: usize = 64;
/// Pool size for longer passwords.
pub const POOL_LEN_LARGE: usize = 128;
/// Only the first MiB of a keyfile contributes.
pub const MAX_KEYFILE_READ: usize = 1024 * 1024;

/// Contents of one keyfile, wiped on drop.
pub struct Keyfile {
    label: String,
    data: Zeroizing<Vec<u8>>,
}

impl Keyfile {
    pub fn from_bytes(label: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            data: Zeroizing::new(data),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(Error::io(format!("cannot open keyfile {}", path.display())))?;
        let mut data = Zeroizing::new(Vec::new());
        file.take(MAX_KEYFILE_READ as u64)
            .read_to_end(&mut data)
            .map_err(Error::io(format!("cannot read keyfile {}", path.display())))?;
        Ok(Self {
            label: path.display().to_string(),
            data,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Keyfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyfile")
            .field("label", &self.label)
            .field("data", &"[REDACTED]")
            .finish()
    }
}

/// Mixes `keyfiles`, in order, into `password`.
///
/// Without keyfiles the password is returned unchanged. With keyfiles the
/// output is exactly one pool long.
pub fn apply_keyfiles(password: &[u8], keyfiles: &[Keyfile]) -> Result<Zeroizing<Vec<u8>>> {
    if keyfiles.is_empty() {
        return Ok(Zeroizing::new(password.to_vec()));
    }
    let pool_len = if password.len() > POOL_LEN {
        POOL_LEN_LARGE
    } else {
        POOL_LEN
    };
    if password.len() > pool_len {
        return Err(Error::Keyfile(format!(
            "password longer than {POOL_LEN_LARGE} bytes cannot be combined with keyfiles"
        )));
    }

    let mut pool = Zeroizing::new(vec![0u8; pool_len]);
    // the write position runs on from one keyfile into the next
    let mut pos = 0;
    for keyfile in keyfiles {
        if keyfile.data.is_empty() {
            return Err(Error::Keyfile(format!("keyfile {} is empty", keyfile.label)));
        }
        let mut crc = u32::MAX;
        for &b in keyfile.data.iter().take(MAX_KEYFILE_READ) {
            crc = crc32::update(crc, b);
            for byte in crc.to_be_bytes() {
                pool[pos] = pool[pos].wrapping_add(byte);
                pos += 1;
            }
            if pos >= pool_len {
                pos = 0;
            }
        }
    }

    let mut mixed = Zeroizing::new(vec![0u8; pool_len]);
    mixed[..password.len()].copy_from_slice(password);
    for (m, p) in mixed.iter_mut().zip(pool.iter()) {
        *m = m.wrapping_add(*p);
    }
    Ok(mixed)
}
