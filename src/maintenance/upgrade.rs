use tracing::{info, warn};

use super::{commit, require_confirmation, rollback, seal, unlock};
use crate::crypto::CipherEngine;
use crate::error::{Error, Result};
use crate::format::{Cleartext, VolumeHeader};
use crate::kdf::{Credential, KdfParams, generate_salt};
use crate::port::Interaction;
use crate::volume::{HeaderBytes, HeaderIo, HeaderSlot, MountControl, MountHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The header already meets the recommended parameters.
    NotNeeded { current: KdfParams },
    Upgraded {
        from: KdfParams,
        to: KdfParams,
        /// Set when the volume was mounted before the upgrade.
        remounted: Option<MountHandle>,
    },
}

/// Re-wraps the master keys under `recommended` KDF parameters.
///
/// The new header is built and verified in memory first. Until it has been
/// written and read back the original header stays in place; a failed write
/// is rolled back. A mounted volume is dismounted for the upgrade and
/// mounted again afterwards, whether or not the upgrade succeeded.
pub fn upgrade_kdf(
    port: &mut dyn Interaction,
    volume: &mut dyn HeaderIo,
    mount: &mut dyn MountControl,
    engine: &CipherEngine,
    recommended: &KdfParams,
) -> Result<UpgradeOutcome> {
    recommended.validate()?;
    let primary = volume.read_header(HeaderSlot::Primary)?;
    let current = Cleartext::parse(&primary)?.kdf;
    if !current.is_outdated(recommended) {
        port.info(&format!("Key derivation is already up to date: {current}"));
        return Ok(UpgradeOutcome::NotNeeded { current });
    }

    require_confirmation(
        port,
        &format!("Upgrade header key derivation from {current} to {recommended}?"),
        true,
        false,
    )?;
    let credential = port.credential("Volume password")?;
    let header = unlock(port, engine, &credential, &primary)?;

    let was_mounted = mount.is_mounted();
    if was_mounted {
        mount.dismount()?;
    }

    let result = rewrap_all(port, volume, engine, &credential, &header, &primary, recommended);

    let remounted = if was_mounted {
        match mount.mount(&credential) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(%err, "remount after KDF upgrade failed");
                port.warning(&format!("The volume could not be mounted again: {err}"));
                None
            }
        }
    } else {
        None
    };

    result?;
    info!(from = %current, to = %recommended, "header KDF upgraded");
    port.info(&format!("Header key derivation upgraded to {recommended}."));
    Ok(UpgradeOutcome::Upgraded {
        from: current,
        to: *recommended,
        remounted,
    })
}

fn rewrap_all(
    port: &mut dyn Interaction,
    volume: &mut dyn HeaderIo,
    engine: &CipherEngine,
    credential: &Credential,
    header: &VolumeHeader,
    original: &HeaderBytes,
    params: &KdfParams,
) -> Result<()> {
    port.enrich_entropy()?;
    let sealed = rewrap(port, engine, credential, header, params)?;

    // the embedded copy is prepared before the first write so a bad
    // credential or derivation failure leaves both slots untouched
    let backup = if volume.has_backup_slot() {
        let bytes = volume.read_header(HeaderSlot::Backup)?;
        match unlock(port, engine, credential, &bytes) {
            Ok(old) => Some((bytes, rewrap(port, engine, credential, &old, params)?)),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(%err, "embedded backup header does not open, leaving it unchanged");
                port.warning("The embedded backup header could not be opened and was not upgraded.");
                None
            }
        }
    } else {
        None
    };

    commit(volume, HeaderSlot::Primary, original, &sealed)?;
    if let Some((backup_original, backup_sealed)) = backup {
        if let Err(err) = commit(volume, HeaderSlot::Backup, &backup_original, &backup_sealed) {
            rollback(volume, HeaderSlot::Primary, original);
            return Err(err);
        }
    }
    Ok(())
}

/// Seals `header` under fresh salt and `params`, then proves the credential
/// opens the result to identical contents.
fn rewrap(
    port: &mut dyn Interaction,
    engine: &CipherEngine,
    credential: &Credential,
    header: &VolumeHeader,
    params: &KdfParams,
) -> Result<HeaderBytes> {
    let upgraded = header.rewrapped(*params, generate_salt()?);
    let sealed = seal(port, engine, credential, &upgraded)?;

    let reopened = unlock(port, engine, credential, &sealed)?;
    if reopened != upgraded {
        return Err(Error::Verification("re-opened header differs".into()));
    }
    Ok(sealed)
}
