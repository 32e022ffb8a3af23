use std::path::PathBuf;

use tracing::{info, warn};

use super::{commit, require_confirmation, rollback, unlock};
use crate::crypto::CipherEngine;
use crate::error::{Error, Result};
use crate::port::{FileMode, Interaction};
use crate::storage::Storage;
use crate::volume::{HeaderBytes, HeaderIo, HeaderSlot};

/// Where a restored header came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// The copy at the end of the volume.
    Embedded,
    File(PathBuf),
}

const SOURCES: [&str; 2] = [
    "Restore from the backup header embedded in the volume",
    "Restore from an external backup file",
];

/// Replaces the primary header with a verified backup copy.
///
/// The candidate is opened with the operator's credential before anything is
/// written. An external file carrying two headers also refreshes the
/// embedded backup slot.
pub fn restore_headers(
    port: &mut dyn Interaction,
    volume: &mut dyn HeaderIo,
    engine: &CipherEngine,
) -> Result<RestoreSource> {
    let embedded = if volume.has_backup_slot() {
        match port.choose("Select the header source", &SOURCES)? {
            Some(0) => true,
            Some(1) => false,
            Some(other) => {
                return Err(Error::Unsupported(format!("restore source {other}")));
            }
            None => return Err(port.cancelled()),
        }
    } else {
        false
    };

    let (source, candidate, extra) = if embedded {
        let bytes = volume.read_header(HeaderSlot::Backup)?;
        (RestoreSource::Embedded, bytes, None)
    } else {
        let path = port.select_file("Header backup file", FileMode::Existing)?;
        let artifact = Storage::new(path.clone()).load_backup()?;
        let extra = artifact.backup().copied();
        (RestoreSource::File(path), *artifact.primary(), extra)
    };

    let credential = port.credential("Password of the backup header")?;
    unlock(port, engine, &credential, &candidate)?;

    let extra = match extra {
        Some(bytes) if volume.has_backup_slot() => {
            match unlock(port, engine, &credential, &bytes) {
                Ok(_) => Some(bytes),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(%err, "second header in backup file does not open");
                    port.warning("The backup file's second header is damaged and will be skipped.");
                    None
                }
            }
        }
        _ => None,
    };

    require_confirmation(
        port,
        "The volume header will be overwritten. This cannot be undone. Continue?",
        false,
        true,
    )?;

    let original: HeaderBytes = volume.read_header(HeaderSlot::Primary)?;
    commit(volume, HeaderSlot::Primary, &original, &candidate)?;
    if let Some(bytes) = extra {
        let original_backup = volume.read_header(HeaderSlot::Backup)?;
        if let Err(err) = commit(volume, HeaderSlot::Backup, &original_backup, &bytes) {
            rollback(volume, HeaderSlot::Primary, &original);
            return Err(err);
        }
    }

    info!(?source, "volume header restored");
    port.info("Volume header restored.");
    Ok(source)
}
