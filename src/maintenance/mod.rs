//! Header maintenance: backup, restore and KDF upgrade.
//!
//! Every protocol gathers all operator decisions and proves the credential
//! before the first write. Writes are read back and compared; a failed
//! commit puts the original bytes back.

mod backup;
mod restore;
mod upgrade;

pub use backup::backup_headers;
pub use restore::{RestoreSource, restore_headers};
pub use upgrade::{UpgradeOutcome, upgrade_kdf};

use serde::Serialize;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{CipherEngine, KEY_AREA_LEN};
use crate::error::{Error, Result};
use crate::format::{Cleartext, VolumeHeader};
use crate::kdf::{Credential, KdfParams, derive_header_key, generate_salt, random_bytes};
use crate::port::Interaction;
use crate::volume::{HeaderBytes, HeaderIo, HeaderSlot};

/// Cleartext facts about a volume, available without a credential.
#[derive(Debug, Clone, Serialize)]
pub struct HeaderInfo {
    pub kdf: KdfParams,
    pub outdated: bool,
    pub backup_slot: bool,
    /// Parameters of the embedded backup header, when it parses.
    pub backup_kdf: Option<KdfParams>,
}

pub fn inspect(volume: &mut dyn HeaderIo, recommended: &KdfParams) -> Result<HeaderInfo> {
    let primary = Cleartext::parse(&volume.read_header(HeaderSlot::Primary)?)?;
    let backup_slot = volume.has_backup_slot();
    let backup_kdf = if backup_slot {
        let bytes = volume.read_header(HeaderSlot::Backup)?;
        Cleartext::parse(&bytes).ok().map(|c| c.kdf)
    } else {
        None
    };
    Ok(HeaderInfo {
        kdf: primary.kdf,
        outdated: primary.kdf.is_outdated(recommended),
        backup_slot,
        backup_kdf,
    })
}

/// Writes fresh headers for a new volume.
///
/// Both headers share newly generated master keys but use independent salts.
pub fn format_volume(
    port: &mut dyn Interaction,
    volume: &mut dyn HeaderIo,
    engine: &CipherEngine,
    params: KdfParams,
    data_size: u64,
) -> Result<()> {
    params.validate()?;
    let credential = port.new_credential()?;
    port.enrich_entropy()?;

    let mut key_area = Zeroizing::new([0u8; KEY_AREA_LEN]);
    random_bytes(&mut key_area[..])?;
    let primary = VolumeHeader::new(params, generate_salt()?, data_size, key_area);

    let original = volume.read_header(HeaderSlot::Primary)?;
    let sealed = seal(port, engine, &credential, &primary)?;
    commit(volume, HeaderSlot::Primary, &original, &sealed)?;

    if volume.has_backup_slot() {
        let backup = primary.rewrapped(params, generate_salt()?);
        let original = volume.read_header(HeaderSlot::Backup)?;
        let sealed = seal(port, engine, &credential, &backup)?;
        commit(volume, HeaderSlot::Backup, &original, &sealed)?;
    }
    port.info(&format!("Volume headers created ({params})"));
    Ok(())
}

/// Brackets `f` with the port's busy indicator, on every exit path.
fn busy<T>(port: &mut dyn Interaction, message: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    port.begin_busy(message);
    let result = f();
    port.end_busy();
    result
}

/// A declined confirmation cancels the protocol.
fn require_confirmation(
    port: &mut dyn Interaction,
    message: &str,
    default: bool,
    warning: bool,
) -> Result<()> {
    if port.confirm(message, default, warning)? {
        Ok(())
    } else {
        Err(port.cancelled())
    }
}

/// Derives the key for `bytes` and opens it.
fn unlock(
    port: &mut dyn Interaction,
    engine: &CipherEngine,
    credential: &Credential,
    bytes: &HeaderBytes,
) -> Result<VolumeHeader> {
    let clear = Cleartext::parse(bytes)?;
    let key = busy(port, "Deriving header key", || {
        derive_header_key(credential, &clear.salt, clear.kdf)
    })?;
    VolumeHeader::open(engine, &key, bytes)
}

/// Seals `header` under a key derived from its own salt and parameters.
fn seal(
    port: &mut dyn Interaction,
    engine: &CipherEngine,
    credential: &Credential,
    header: &VolumeHeader,
) -> Result<HeaderBytes> {
    let key = busy(port, "Deriving header key", || {
        derive_header_key(credential, header.salt(), *header.kdf())
    })?;
    let sealed = header.seal(engine, &key)?;
    Ok(*sealed)
}

/// Writes `sealed` into `slot` and reads it back; restores `original` if
/// either step fails.
fn commit(
    volume: &mut dyn HeaderIo,
    slot: HeaderSlot,
    original: &HeaderBytes,
    sealed: &HeaderBytes,
) -> Result<()> {
    let result = volume.write_header(slot, sealed).and_then(|()| {
        if volume.read_header(slot)? == *sealed {
            Ok(())
        } else {
            Err(Error::Verification(format!("{slot:?} header read back differs")))
        }
    });

    if let Err(err) = result {
        warn!(?slot, %err, "header commit failed, restoring original");
        rollback(volume, slot, original);
        return Err(err);
    }
    info!(?slot, "header committed");
    Ok(())
}

fn rollback(volume: &mut dyn HeaderIo, slot: HeaderSlot, original: &HeaderBytes) {
    if let Err(err) = volume.write_header(slot, original) {
        error!(?slot, %err, "could not restore original header");
    }
}
