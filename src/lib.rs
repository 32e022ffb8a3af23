//! Volume header cryptography.
//!
//! Argon2 key derivation, an AES block engine with hardware dispatch, and
//! the header maintenance protocols (backup, restore, KDF upgrade) built on
//! top of them.

pub mod crypto;
pub mod error;
pub mod format;
pub mod kdf;
pub mod maintenance;
pub mod port;
pub mod storage;
pub mod volume;

use std::path::PathBuf;

use directories::ProjectDirs;

pub use crate::crypto::{CipherEngine, CpuFeatures};
pub use crate::error::{Error, Result};
pub use crate::kdf::{Credential, KdfAlgorithm, KdfParams};
pub use crate::port::{FileMode, Interaction};
pub use crate::storage::Storage;
pub use crate::volume::{Detached, FileVolume, HeaderIo, HeaderSlot, MountControl};

/// Directory suggested for header backup files, when the platform has one.
pub fn default_backup_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "volkey").map(|dirs| dirs.data_dir().join("backups"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::VolumeHeader;
    use crate::kdf::derive_header_key;
    use crate::volume::HeaderBytes;
    use tempfile::tempdir;

    struct Scripted {
        password: &'static str,
    }

    impl Interaction for Scripted {
        fn password(&mut self, _: &str) -> Result<zeroize::Zeroizing<Vec<u8>>> {
            Ok(zeroize::Zeroizing::new(self.password.as_bytes().to_vec()))
        }
        fn keyfiles(&mut self) -> Result<Vec<crypto::Keyfile>> {
            Ok(Vec::new())
        }
        fn select_file(&mut self, _: &str, _: FileMode) -> Result<PathBuf> {
            Err(Error::Cancelled)
        }
        fn confirm(&mut self, _: &str, _: bool, _: bool) -> Result<bool> {
            Ok(true)
        }
        fn choose(&mut self, _: &str, _: &[&str]) -> Result<Option<usize>> {
            Ok(None)
        }
        fn info(&mut self, _: &str) {}
        fn warning(&mut self, _: &str) {}
        fn error(&mut self, _: &str) {}
        fn begin_busy(&mut self, _: &str) {}
        fn end_busy(&mut self) {}
    }

    #[test]
    fn format_then_open_file_volume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let mut volume = FileVolume::create(&path, 8192).unwrap();
        let engine = CipherEngine::new(CpuFeatures::detect());
        let params = KdfParams::argon2id(32, 1, 1).unwrap();

        let mut port = Scripted { password: "pw" };
        maintenance::format_volume(&mut port, &mut volume, &engine, params, 8192).unwrap();

        let mut volume = FileVolume::open(&path).unwrap();
        for slot in [HeaderSlot::Primary, HeaderSlot::Backup] {
            let bytes: HeaderBytes = volume.read_header(slot).unwrap();
            let salt: [u8; crypto::SALT_LEN] = bytes[..crypto::SALT_LEN].try_into().unwrap();
            let key = derive_header_key(&Credential::from_password("pw"), &salt, params).unwrap();
            let header = VolumeHeader::open(&engine, &key, &bytes).unwrap();
            assert_eq!(header.data_size(), 8192);
        }

        let primary = volume.read_header(HeaderSlot::Primary).unwrap();
        let backup = volume.read_header(HeaderSlot::Backup).unwrap();
        assert_ne!(primary[..crypto::SALT_LEN], backup[..crypto::SALT_LEN]);
    }

    #[test]
    fn default_backup_dir_is_named_after_crate() {
        if let Some(dir) = default_backup_dir() {
            assert!(dir.ends_with("backups"));
        }
    }
}
