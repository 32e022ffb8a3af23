//! Header format v1.
//!
//! KDF parameter block (cleartext, offset 64):
//! ```text
//! ALGORITHM (1) | RESERVED (3) | MEM_COST (4) | ITERATIONS (4) | PARALLELISM (4)
//! ```
//!
//! Decrypted region (offset 80):
//! ```text
//! MAGIC (4) | VERSION (2) | RESERVED (2) | DATA_SIZE (8) | KEY_AREA_CRC (4) |
//! RESERVED (152) | HEADER_CRC (4) | KEY_AREA (256)
//! ```
//! HEADER_CRC covers the first 172 bytes of the decrypted region.

use zeroize::Zeroizing;

use super::{Cleartext, ENCRYPTED_LEN, MAGIC, PARAMS_LEN, VolumeHeader};
use crate::crypto::{KEY_AREA_LEN, crc32};
use crate::error::{Error, Result};
use crate::kdf::{KdfAlgorithm, KdfParams};

pub const VERSION_V1: u16 = 1;

const VERSION_OFFSET: usize = 4;
const DATA_SIZE_OFFSET: usize = 8;
const KEY_CRC_OFFSET: usize = 16;
const HEADER_CRC_OFFSET: usize = 172;
const KEY_AREA_OFFSET: usize = 176;

pub fn encode_params(kdf: &KdfParams) -> [u8; PARAMS_LEN] {
    let mut buf = [0u8; PARAMS_LEN];
    buf[0] = kdf.algorithm().id();
    buf[4..8].copy_from_slice(&kdf.mem_cost_kib().to_le_bytes());
    buf[8..12].copy_from_slice(&kdf.time_cost().to_le_bytes());
    buf[12..16].copy_from_slice(&kdf.parallelism().to_le_bytes());
    buf
}

pub fn decode_params(data: &[u8]) -> Result<KdfParams> {
    if data.len() != PARAMS_LEN {
        return Err(Error::MalformedHeader("KDF parameter block too short".into()));
    }
    let algorithm = KdfAlgorithm::from_id(data[0])
        .ok_or_else(|| Error::MalformedHeader(format!("unknown KDF algorithm {}", data[0])))?;
    if data[1..4] != [0, 0, 0] {
        return Err(Error::MalformedHeader("reserved KDF bytes are not zero".into()));
    }

    let mem_cost = read_u32(data, 4);
    let time_cost = read_u32(data, 8);
    let parallelism = read_u32(data, 12);

    KdfParams::new(algorithm, mem_cost, time_cost, parallelism)
        .map_err(|e| Error::MalformedHeader(e.to_string()))
}

pub(super) fn encode_body(header: &VolumeHeader) -> Zeroizing<[u8; ENCRYPTED_LEN]> {
    let mut body = Zeroizing::new([0u8; ENCRYPTED_LEN]);
    body[..MAGIC.len()].copy_from_slice(MAGIC);
    body[VERSION_OFFSET..VERSION_OFFSET + 2].copy_from_slice(&VERSION_V1.to_le_bytes());
    body[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 8].copy_from_slice(&header.data_size().to_le_bytes());
    body[KEY_AREA_OFFSET..].copy_from_slice(header.key_area());

    let key_crc = crc32::checksum(header.key_area());
    body[KEY_CRC_OFFSET..KEY_CRC_OFFSET + 4].copy_from_slice(&key_crc.to_le_bytes());
    let header_crc = crc32::checksum(&body[..HEADER_CRC_OFFSET]);
    body[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].copy_from_slice(&header_crc.to_le_bytes());
    body
}

/// Checksum mismatches mean the key did not decrypt the region.
pub(super) fn decode_body(body: &[u8; ENCRYPTED_LEN], cleartext: Cleartext) -> Result<VolumeHeader> {
    if read_u32(body, HEADER_CRC_OFFSET) != crc32::checksum(&body[..HEADER_CRC_OFFSET]) {
        return Err(Error::WrongCredential);
    }
    let key_area = &body[KEY_AREA_OFFSET..];
    if read_u32(body, KEY_CRC_OFFSET) != crc32::checksum(key_area) {
        return Err(Error::WrongCredential);
    }

    let mut keys = Zeroizing::new([0u8; KEY_AREA_LEN]);
    keys.copy_from_slice(key_area);
    let mut size = [0u8; 8];
    size.copy_from_slice(&body[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 8]);

    Ok(VolumeHeader::new(
        cleartext.kdf,
        cleartext.salt,
        u64::from_le_bytes(size),
        keys,
    ))
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_roundtrip() {
        let kdf = KdfParams::argon2id(65536, 3, 2).unwrap();
        let bytes = encode_params(&kdf);

        assert_eq!(bytes[0], KdfAlgorithm::Argon2id.id());
        assert_eq!(&bytes[4..8], &65536u32.to_le_bytes());
        assert_eq!(decode_params(&bytes).unwrap(), kdf);
    }

    #[test]
    fn unknown_algorithm_fails() {
        let mut bytes = encode_params(&KdfParams::default());
        bytes[0] = 99;
        assert!(matches!(decode_params(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn invalid_costs_fail() {
        let mut bytes = encode_params(&KdfParams::default());
        bytes[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(decode_params(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn reserved_bytes_must_be_zero() {
        let mut bytes = encode_params(&KdfParams::default());
        bytes[2] = 1;
        assert!(decode_params(&bytes).is_err());
    }

    #[test]
    fn body_layout_and_checksums() {
        let key_area = Zeroizing::new([0x5au8; KEY_AREA_LEN]);
        let header = VolumeHeader::new(KdfParams::default(), [0u8; 64], 4096, key_area);
        let body = encode_body(&header);

        assert_eq!(&body[..4], MAGIC);
        assert_eq!(&body[4..6], &VERSION_V1.to_le_bytes());
        assert_eq!(&body[8..16], &4096u64.to_le_bytes());
        assert_eq!(read_u32(&body[..], KEY_CRC_OFFSET), crc32::checksum(&[0x5a; KEY_AREA_LEN]));

        let clear = Cleartext {
            salt: [0u8; 64],
            kdf: KdfParams::default(),
        };
        assert_eq!(decode_body(&body, clear).unwrap(), header);

        let mut corrupted = *body;
        corrupted[KEY_AREA_OFFSET] ^= 1;
        assert!(matches!(decode_body(&corrupted, clear), Err(Error::WrongCredential)));
    }
}
