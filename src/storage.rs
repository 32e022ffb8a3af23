//! Header backup files.
//!
//! ```text
//! MAGIC (4) | VERSION (1) | COUNT (1) | CREATED (8) | PRIMARY (512) | [BACKUP (512)]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::format::HEADER_LEN;
use crate::kdf::random_bytes;
use crate::volume::HeaderBytes;

/// Magic bytes identifying a header backup file ("VKBK").
pub const BACKUP_MAGIC: &[u8; 4] = b"VKBK";
pub const BACKUP_VERSION: u8 = 1;
const PREFIX_LEN: usize = 4 + 1 + 1 + 8;

/// A header backup: the primary header and, when the volume had one, its
/// embedded backup header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    created: DateTime<Utc>,
    primary: HeaderBytes,
    backup: Option<HeaderBytes>,
}

impl BackupArtifact {
    /// Creates an artifact stamped with the current time, truncated to seconds.
    pub fn new(primary: HeaderBytes, backup: Option<HeaderBytes>) -> Self {
        let now = Utc::now();
        // stored with whole-second precision
        let created = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        Self {
            created,
            primary,
            backup,
        }
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn primary(&self) -> &HeaderBytes {
        &self.primary
    }

    pub fn backup(&self) -> Option<&HeaderBytes> {
        self.backup.as_ref()
    }

    /// Serializes the artifact into the backup file layout.
    pub fn encode(&self) -> Vec<u8> {
        let count = if self.backup.is_some() { 2 } else { 1 };
        let mut buf = Vec::with_capacity(PREFIX_LEN + count * HEADER_LEN);
        buf.extend_from_slice(BACKUP_MAGIC);
        buf.push(BACKUP_VERSION);
        buf.push(count as u8);
        buf.extend_from_slice(&self.created.timestamp().to_le_bytes());
        buf.extend_from_slice(&self.primary);
        if let Some(backup) = &self.backup {
            buf.extend_from_slice(backup);
        }
        buf
    }

    /// # Errors
    ///
    /// Returns `MalformedHeader` for a wrong magic, an unknown version, a
    /// header count other than 1 or 2, or a length that does not match it.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PREFIX_LEN || &data[..4] != BACKUP_MAGIC {
            return Err(Error::MalformedHeader("not a header backup file".into()));
        }
        if data[4] != BACKUP_VERSION {
            return Err(Error::MalformedHeader(format!(
                "unsupported backup file version {}",
                data[4]
            )));
        }
        let count = data[5] as usize;
        if !(1..=2).contains(&count) || data.len() != PREFIX_LEN + count * HEADER_LEN {
            return Err(Error::MalformedHeader(format!(
                "backup file length {} does not match {count} headers",
                data.len()
            )));
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[6..14]);
        let created = DateTime::from_timestamp(i64::from_le_bytes(ts), 0)
            .ok_or_else(|| Error::MalformedHeader("backup timestamp out of range".into()))?;

        let header_at = |i: usize| {
            let mut h = [0u8; HEADER_LEN];
            let start = PREFIX_LEN + i * HEADER_LEN;
            h.copy_from_slice(&data[start..start + HEADER_LEN]);
            h
        };
        Ok(Self {
            created,
            primary: header_at(0),
            backup: (count == 2).then(|| header_at(1)),
        })
    }
}

/// A backup file on disk.
///
/// Writes go to a temporary sibling that atomically replaces the target, so
/// a crash leaves either the old or the new file, never a partial one.
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    /// Creates a storage handle for the file at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns `true` if the file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns the path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the entire file into memory.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read.
    pub fn load(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(Error::io(format!("cannot read {}", self.path.display())))
    }

    /// Loads and decodes a header backup.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `MalformedHeader` if it is
    /// not a header backup.
    pub fn load_backup(&self) -> Result<BackupArtifact> {
        BackupArtifact::decode(&self.load()?)
    }

    /// Writes `artifact` with the same atomic replace as [`Storage::save`].
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be written; the previous file, if any,
    /// is left in place.
    pub fn save_backup(&self, artifact: &BackupArtifact) -> Result<()> {
        self.save(&artifact.encode())?;
        info!(
            path = %self.path.display(),
            headers = if artifact.backup.is_some() { 2 } else { 1 },
            "header backup written"
        );
        Ok(())
    }

    /// Saves `data` with an atomic replace, creating parent directories.
    ///
    /// The data goes to a random temporary sibling which is synced and then
    /// renamed over the target; the parent directory is synced last.
    ///
    /// # Errors
    ///
    /// Returns `Io` if any step fails. The temporary file is removed when the
    /// replace fails.
    pub fn save(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(Error::io(format!("cannot create directory {}", parent.display())))?;
        }

        let tmp_path = self.random_tmp_path()?;

        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(Error::io("failed to create temporary file"))?;
        tmp_file
            .write_all(data)
            .and_then(|()| tmp_file.sync_all())
            .map_err(Error::io(format!("cannot write {}", self.path.display())))?;
        drop(tmp_file);

        if let Err(e) = self.atomic_replace(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)
                .and_then(|dir| dir.sync_all())
                .map_err(Error::io(format!("cannot sync directory {}", parent.display())))?;
        }
        debug!(path = %self.path.display(), len = data.len(), "file saved");
        Ok(())
    }

    /// `<name>.tmp.<random hex>` in the same directory.
    fn random_tmp_path(&self) -> Result<PathBuf> {
        let mut buf = [0u8; 8];
        random_bytes(&mut buf)?;
        let suffix: String = buf.iter().map(|b| format!("{b:02x}")).collect();

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| Error::Io {
                context: format!("{} has no file name", self.path.display()),
                source: std::io::ErrorKind::InvalidInput.into(),
            })?
            .to_string_lossy();

        Ok(self.path.with_file_name(format!("{file_name}.tmp.{suffix}")))
    }

    #[cfg(target_os = "windows")]
    fn atomic_replace(&self, tmp_path: &Path) -> Result<()> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{
            MOVEFILE_REPLACE_EXISTING, MOVEFILE_WRITE_THROUGH, MoveFileExW,
        };

        fn to_wide(s: &OsStr) -> Vec<u16> {
            s.encode_wide().chain(std::iter::once(0)).collect()
        }

        let target_w = to_wide(self.path.as_os_str());
        let tmp_w = to_wide(tmp_path.as_os_str());

        // SAFETY:
        // - both strings are null-terminated UTF-16
        // - the pointers stay valid for the duration of the call
        let result = unsafe {
            MoveFileExW(
                tmp_w.as_ptr(),
                target_w.as_ptr(),
                MOVEFILE_REPLACE_EXISTING | MOVEFILE_WRITE_THROUGH,
            )
        };

        if result == 0 {
            return Err(Error::Io {
                context: "atomic replace failed".into(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// `rename()` is atomic when both paths are on the same filesystem.
    #[cfg(not(target_os = "windows"))]
    fn atomic_replace(&self, tmp_path: &Path) -> Result<()> {
        fs::rename(tmp_path, &self.path).map_err(Error::io("atomic replace failed"))
    }
}
