//! CRC-32 (IEEE 802.3, reflected) for header integrity and keyfile mixing.

const POLY: u32 = 0xedb8_8320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { POLY ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

const TABLE: [u32; 256] = build_table();

/// Advances a running (non-finalized) CRC register by one byte.
#[inline]
pub fn update(crc: u32, byte: u8) -> u32 {
    TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8)
}

pub fn checksum(data: &[u8]) -> u32 {
    !data.iter().fold(u32::MAX, |crc, &b| update(crc, b))
}
