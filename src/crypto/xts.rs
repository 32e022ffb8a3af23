//! XTS sealing of the header's encrypted region.
//!
//! The XTS construction comes from `xts-mode`; the block cipher underneath is
//! this crate's [`CipherEngine`], exposed through the `cipher` traits.

use cipher::consts::U16;
use cipher::{BlockCipher, impl_simple_block_encdec};
use xts_mode::{Xts128, get_tweak_default};

use super::aes::{BLOCK_LEN, CipherEngine, RoundKeySchedule};
use crate::error::{Error, Result};

/// One AES key bound to an engine, with both schedules expanded.
pub struct EngineCipher {
    engine: CipherEngine,
    enc: RoundKeySchedule,
    dec: RoundKeySchedule,
}

impl EngineCipher {
    pub fn new(engine: &CipherEngine, key: &[u8]) -> Result<Self> {
        Ok(Self {
            engine: *engine,
            enc: RoundKeySchedule::encrypt(key)?,
            dec: RoundKeySchedule::decrypt(key)?,
        })
    }
}

impl BlockCipher for EngineCipher {}

impl_simple_block_encdec!(
    EngineCipher, U16, cipher, block,
    encrypt: {
        let mut buf = [0u8; BLOCK_LEN];
        buf.copy_from_slice(block.get_in());
        cipher.engine.encrypt_checked(&cipher.enc, &mut buf);
        block.get_out().copy_from_slice(&buf);
    }
    decrypt: {
        let mut buf = [0u8; BLOCK_LEN];
        buf.copy_from_slice(block.get_in());
        cipher.engine.decrypt_checked(&cipher.dec, &mut buf);
        block.get_out().copy_from_slice(&buf);
    }
);

/// An XTS key pair (data key, tweak key).
pub struct XtsKeys {
    xts: Xts128<EngineCipher>,
}

impl XtsKeys {
    /// `key` is the data key followed by the tweak key, each 16, 24 or 32 bytes.
    pub fn new(engine: &CipherEngine, key: &[u8]) -> Result<Self> {
        if key.len() % 2 != 0 {
            return Err(Error::InvalidKeyLength(key.len()));
        }
        let (data, tweak) = key.split_at(key.len() / 2);
        Ok(Self {
            xts: Xts128::new(EngineCipher::new(engine, data)?, EngineCipher::new(engine, tweak)?),
        })
    }
}

/// Encrypts `data` as the single data unit `unit`.
pub fn encrypt(keys: &XtsKeys, unit: u64, data: &mut [u8]) -> Result<()> {
    check_len(data)?;
    keys.xts.encrypt_sector(data, get_tweak_default(u128::from(unit)));
    Ok(())
}

pub fn decrypt(keys: &XtsKeys, unit: u64, data: &mut [u8]) -> Result<()> {
    check_len(data)?;
    keys.xts.decrypt_sector(data, get_tweak_default(u128::from(unit)));
    Ok(())
}

/// Whole blocks only; the header region never needs ciphertext stealing.
fn check_len(data: &[u8]) -> Result<()> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(Error::InvalidLength(data.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CpuFeatures;
    use cipher::{BlockDecrypt, BlockEncrypt};

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn ieee1619_vector_1() {
        // all-zero keys, unit 0, 32 zero bytes
        let engine = CipherEngine::software();
        let keys = XtsKeys::new(&engine, &[0u8; 32]).unwrap();
        let mut data = [0u8; 32];
        encrypt(&keys, 0, &mut data).unwrap();
        assert_eq!(
            data.to_vec(),
            hex("917cf69ebd68b2ec9b9fe9a3eadda692cd43d2f59598ed858c02c2652fbf922e")
        );
    }

    #[test]
    fn engine_cipher_matches_engine() {
        let engine = CipherEngine::new(CpuFeatures::detect());
        let key = [9u8; 32];
        let half = EngineCipher::new(&engine, &key).unwrap();

        let mut via_trait = cipher::Block::<EngineCipher>::clone_from_slice(&[0x42u8; BLOCK_LEN]);
        half.encrypt_block(&mut via_trait);

        let mut direct = [0x42u8; BLOCK_LEN];
        engine
            .encrypt_block(&RoundKeySchedule::encrypt(&key).unwrap(), &mut direct)
            .unwrap();
        assert_eq!(via_trait.as_slice(), &direct);

        half.decrypt_block(&mut via_trait);
        assert_eq!(via_trait.as_slice(), &[0x42u8; BLOCK_LEN]);
    }

    #[test]
    fn backends_produce_same_ciphertext() {
        let plain: Vec<u8> = (0..=255u8).cycle().take(432).collect();
        let mut soft = plain.clone();
        let mut detected = plain.clone();

        let soft_engine = CipherEngine::software();
        let detected_engine = CipherEngine::new(CpuFeatures::detect());
        encrypt(&XtsKeys::new(&soft_engine, &[7u8; 64]).unwrap(), 0, &mut soft).unwrap();
        encrypt(&XtsKeys::new(&detected_engine, &[7u8; 64]).unwrap(), 0, &mut detected).unwrap();
        assert_eq!(soft, detected);
    }

    #[test]
    fn roundtrip_and_unit_binding() {
        let engine = CipherEngine::software();
        let keys = XtsKeys::new(&engine, &[5u8; 64]).unwrap();
        let plain: Vec<u8> = (0..=255u8).cycle().take(432).collect();

        let mut data = plain.clone();
        encrypt(&keys, 7, &mut data).unwrap();
        assert_ne!(data, plain);

        let mut other = data.clone();
        decrypt(&keys, 8, &mut other).unwrap();
        assert_ne!(other, plain);

        decrypt(&keys, 7, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn empty_or_partial_input_fails() {
        let engine = CipherEngine::software();
        let keys = XtsKeys::new(&engine, &[5u8; 64]).unwrap();
        assert!(encrypt(&keys, 0, &mut []).is_err());
        assert!(encrypt(&keys, 0, &mut [0u8; 17]).is_err());
        assert!(matches!(
            XtsKeys::new(&engine, &[0u8; 33]),
            Err(Error::InvalidKeyLength(33))
        ));
    }
}
