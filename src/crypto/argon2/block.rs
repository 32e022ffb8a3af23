use std::ops::BitXorAssign;

use zeroize::Zeroize;

pub const BLOCK_WORDS: usize = 128;
pub const BLOCK_BYTES: usize = BLOCK_WORDS * 8;

/// One 1 KiB cell of the memory matrix.
#[derive(Clone, Copy)]
pub struct Block(pub(super) [u64; BLOCK_WORDS]);

impl Block {
    pub const ZERO: Block = Block([0; BLOCK_WORDS]);

    pub fn from_bytes(bytes: &[u8; BLOCK_BYTES]) -> Self {
        let mut block = Self::ZERO;
        for (word, chunk) in block.0.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut le = [0u8; 8];
            le.copy_from_slice(chunk);
            *word = u64::from_le_bytes(le);
        }
        block
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_BYTES] {
        let mut bytes = [0u8; BLOCK_BYTES];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(self.0.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn word(&self, index: usize) -> u64 {
        self.0[index]
    }

    /// Compression G(x, y) = P(R) ^ R with R = x ^ y.
    ///
    /// P runs the BLAKE2b round over the eight 16-word rows, then over the
    /// eight 16-word columns made of adjacent word pairs.
    pub fn compress(x: &Block, y: &Block) -> Block {
        let mut r = *x;
        r ^= y;
        let mut q = r;

        for i in 0..8 {
            let b = 16 * i;
            round(
                &mut q.0,
                [
                    b,
                    b + 1,
                    b + 2,
                    b + 3,
                    b + 4,
                    b + 5,
                    b + 6,
                    b + 7,
                    b + 8,
                    b + 9,
                    b + 10,
                    b + 11,
                    b + 12,
                    b + 13,
                    b + 14,
                    b + 15,
                ],
            );
        }
        for i in 0..8 {
            let b = 2 * i;
            round(
                &mut q.0,
                [
                    b,
                    b + 1,
                    b + 16,
                    b + 17,
                    b + 32,
                    b + 33,
                    b + 48,
                    b + 49,
                    b + 64,
                    b + 65,
                    b + 80,
                    b + 81,
                    b + 96,
                    b + 97,
                    b + 112,
                    b + 113,
                ],
            );
        }

        q ^= &r;
        r.zeroize();
        q
    }
}

impl BitXorAssign<&Block> for Block {
    fn bitxor_assign(&mut self, rhs: &Block) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

impl Zeroize for Block {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

#[inline(always)]
fn blamka(x: u64, y: u64) -> u64 {
    let low = (x & 0xffff_ffff) * (y & 0xffff_ffff);
    x.wrapping_add(y).wrapping_add(low.wrapping_mul(2))
}

#[inline(always)]
fn g(v: &mut [u64; BLOCK_WORDS], a: usize, b: usize, c: usize, d: usize) {
    v[a] = blamka(v[a], v[b]);
    v[d] = (v[d] ^ v[a]).rotate_right(32);
    v[c] = blamka(v[c], v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(24);
    v[a] = blamka(v[a], v[b]);
    v[d] = (v[d] ^ v[a]).rotate_right(16);
    v[c] = blamka(v[c], v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(63);
}

fn round(v: &mut [u64; BLOCK_WORDS], i: [usize; 16]) {
    g(v, i[0], i[4], i[8], i[12]);
    g(v, i[1], i[5], i[9], i[13]);
    g(v, i[2], i[6], i[10], i[14]);
    g(v, i[3], i[7], i[11], i[15]);
    g(v, i[0], i[5], i[10], i[15]);
    g(v, i[1], i[6], i[11], i[12]);
    g(v, i[2], i[7], i[8], i[13]);
    g(v, i[3], i[4], i[9], i[14]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_roundtrip_little_endian() {
        let mut bytes = [0u8; BLOCK_BYTES];
        bytes[0] = 1;
        bytes[9] = 2;
        let block = Block::from_bytes(&bytes);
        assert_eq!(block.word(0), 1);
        assert_eq!(block.word(1), 0x200);
        assert_eq!(block.to_bytes(), bytes);
    }

    #[test]
    fn compress_of_zero_is_zero() {
        let out = Block::compress(&Block::ZERO, &Block::ZERO);
        assert!(out.0.iter().all(|&w| w == 0));
    }

    #[test]
    fn compress_is_symmetric_in_inputs() {
        // only x ^ y enters the permutation
        let mut x = Block::ZERO;
        let mut y = Block::ZERO;
        x.0[3] = 0xdead_beef;
        y.0[77] = 42;
        assert_eq!(Block::compress(&x, &y).0, Block::compress(&y, &x).0);
        assert_ne!(Block::compress(&x, &y).0, Block::ZERO.0);
    }
}
