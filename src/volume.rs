//! Volume collaborators: header slots and mount control.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::format::HEADER_LEN;
use crate::kdf::Credential;

/// Where a header lives inside a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSlot {
    Primary,
    /// The embedded backup copy.
    Backup,
}

pub type HeaderBytes = [u8; HEADER_LEN];

/// Raw access to a volume's header slots.
pub trait HeaderIo {
    /// Reads the 512 bytes stored in `slot`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the slot cannot be read.
    fn read_header(&mut self, slot: HeaderSlot) -> Result<HeaderBytes>;

    /// Persists `bytes` into `slot`; returns only once the write is durable.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the write or the sync fails. The slot may then hold a
    /// partial write.
    fn write_header(&mut self, slot: HeaderSlot, bytes: &HeaderBytes) -> Result<()>;

    /// Returns `true` if the volume carries an embedded backup header.
    fn has_backup_slot(&self) -> bool;
}

/// A file-backed volume.
///
/// ```text
/// PRIMARY HEADER (512) | DATA AREA | BACKUP HEADER (512)
/// ```
#[derive(Debug, Clone)]
pub struct FileVolume {
    path: PathBuf,
    len: u64,
}

impl FileVolume {
    /// Creates a new zero-filled volume with room for `data_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file already exists or cannot be created, sized
    /// or synced.
    pub fn create(path: &Path, data_size: u64) -> Result<Self> {
        let len = data_size + 2 * HEADER_LEN as u64;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(Error::io(format!("cannot create volume {}", path.display())))?;
        file.set_len(len)
            .map_err(Error::io(format!("cannot size volume {}", path.display())))?;
        file.sync_all()
            .map_err(Error::io(format!("cannot sync volume {}", path.display())))?;
        debug!(path = %path.display(), len, "created volume file");
        Ok(Self {
            path: path.to_path_buf(),
            len,
        })
    }

    /// Opens an existing volume file.
    ///
    /// Only the size is checked here; header contents are read on demand.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file metadata cannot be read and `MalformedHeader`
    /// if the file is too small to hold both header slots.
    pub fn open(path: &Path) -> Result<Self> {
        let len = std::fs::metadata(path)
            .map_err(Error::io(format!("cannot open volume {}", path.display())))?
            .len();
        if len < 2 * HEADER_LEN as u64 {
            return Err(Error::MalformedHeader(format!(
                "{} is too small to be a volume",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            len,
        })
    }

    /// Returns the path of the volume file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes between the two header slots.
    pub fn data_size(&self) -> u64 {
        self.len - 2 * HEADER_LEN as u64
    }

    fn offset(&self, slot: HeaderSlot) -> u64 {
        match slot {
            HeaderSlot::Primary => 0,
            HeaderSlot::Backup => self.len - HEADER_LEN as u64,
        }
    }
}

impl HeaderIo for FileVolume {
    fn read_header(&mut self, slot: HeaderSlot) -> Result<HeaderBytes> {
        let context = || format!("cannot read {slot:?} header of {}", self.path.display());
        let mut file = File::open(&self.path).map_err(Error::io(context()))?;
        file.seek(SeekFrom::Start(self.offset(slot)))
            .map_err(Error::io(context()))?;
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf).map_err(Error::io(context()))?;
        Ok(buf)
    }

    fn write_header(&mut self, slot: HeaderSlot, bytes: &HeaderBytes) -> Result<()> {
        let context = || format!("cannot write {slot:?} header of {}", self.path.display());
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(Error::io(context()))?;
        file.seek(SeekFrom::Start(self.offset(slot)))
            .map_err(Error::io(context()))?;
        file.write_all(bytes).map_err(Error::io(context()))?;
        file.sync_all().map_err(Error::io(context()))?;
        debug!(?slot, path = %self.path.display(), "header written");
        Ok(())
    }

    fn has_backup_slot(&self) -> bool {
        true
    }
}

/// Identifies a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    /// Where the volume is mounted, e.g. a drive letter or mount point.
    pub target: String,
}

/// Mounting collaborator used by the KDF upgrade.
///
/// A mounted volume is dismounted before its headers are rewritten and
/// mounted again afterwards.
pub trait MountControl {
    /// Returns `true` if the volume is currently mounted.
    fn is_mounted(&self) -> bool;

    /// Dismounts the volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume is in use or cannot be dismounted; the
    /// upgrade is then abandoned before any header is written.
    fn dismount(&mut self) -> Result<()>;

    /// Mounts the volume with `credential`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if the collaborator cannot mount, or any error
    /// raised while opening the volume.
    fn mount(&mut self, credential: &Credential) -> Result<MountHandle>;
}

/// Mount control for a volume that is never mounted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl MountControl for Detached {
    fn is_mounted(&self) -> bool {
        false
    }

    fn dismount(&mut self) -> Result<()> {
        Ok(())
    }

    fn mount(&mut self, _credential: &Credential) -> Result<MountHandle> {
        Err(Error::Unsupported("mounting a detached volume".into()))
    }
}
