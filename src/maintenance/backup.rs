use std::path::PathBuf;

use tracing::warn;

use super::{require_confirmation, unlock};
use crate::crypto::CipherEngine;
use crate::error::Result;
use crate::port::{FileMode, Interaction};
use crate::storage::{BackupArtifact, Storage};
use crate::volume::{HeaderIo, HeaderSlot};

/// Saves the volume's headers to a backup file chosen by the operator.
///
/// The credential must open the primary header. The embedded backup header
/// is included only when the same credential opens it too. The volume is
/// never written.
pub fn backup_headers(
    port: &mut dyn Interaction,
    volume: &mut dyn HeaderIo,
    engine: &CipherEngine,
) -> Result<PathBuf> {
    let path = port.select_file("Save header backup as", FileMode::New)?;
    let storage = Storage::new(path);
    if storage.exists() {
        require_confirmation(
            port,
            &format!("{} already exists. Overwrite it?", storage.path().display()),
            false,
            true,
        )?;
    }

    let credential = port.credential("Volume password")?;
    let primary = volume.read_header(HeaderSlot::Primary)?;
    unlock(port, engine, &credential, &primary)?;

    let backup = if volume.has_backup_slot() {
        let bytes = volume.read_header(HeaderSlot::Backup)?;
        match unlock(port, engine, &credential, &bytes) {
            Ok(_) => Some(bytes),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(%err, "embedded backup header does not open");
                port.warning("The embedded backup header is damaged and was not included.");
                None
            }
        }
    } else {
        None
    };

    storage.save_backup(&BackupArtifact::new(primary, backup))?;
    port.info(&format!("Header backup saved to {}", storage.path().display()));
    Ok(storage.path().to_path_buf())
}
