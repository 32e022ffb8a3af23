//! Portable AES rounds.
//!
//! Table-driven, so timing depends on the data on hosts without AES-NI.

const fn xtime(x: u8) -> u8 {
    (x << 1) ^ (((x >> 7) & 1) * 0x1b)
}

const fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        a = xtime(a);
        b >>= 1;
    }
    product
}

/// Multiplicative inverse in GF(2^8) as x^254; maps 0 to 0.
const fn ginv(x: u8) -> u8 {
    let mut result = 1u8;
    let mut base = x;
    let mut exp = 254u8;
    while exp != 0 {
        if exp & 1 != 0 {
            result = gmul(result, base);
        }
        base = gmul(base, base);
        exp >>= 1;
    }
    result
}

const fn build_sboxes() -> ([u8; 256], [u8; 256]) {
    let mut sbox = [0u8; 256];
    let mut inv = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let b = ginv(i as u8);
        let s = b
            ^ b.rotate_left(1)
            ^ b.rotate_left(2)
            ^ b.rotate_left(3)
            ^ b.rotate_left(4)
            ^ 0x63;
        sbox[i] = s;
        inv[s as usize] = i as u8;
        i += 1;
    }
    (sbox, inv)
}

const SBOXES: ([u8; 256], [u8; 256]) = build_sboxes();
pub(super) const SBOX: [u8; 256] = SBOXES.0;
const INV_SBOX: [u8; 256] = SBOXES.1;

/// Round constant following `rcon` in the key expansion.
pub(super) const fn next_rcon(rcon: u8) -> u8 {
    xtime(rcon)
}

fn sub_bytes(s: &mut [u8; 16]) {
    for b in s.iter_mut() {
        *b = SBOX[*b as usize];
    }
}

fn inv_sub_bytes(s: &mut [u8; 16]) {
    for b in s.iter_mut() {
        *b = INV_SBOX[*b as usize];
    }
}

// State is column-major: byte (row r, column c) lives at r + 4c.
fn shift_rows(s: &mut [u8; 16]) {
    let t = *s;
    for c in 0..4 {
        for r in 0..4 {
            s[r + 4 * c] = t[r + 4 * ((c + r) % 4)];
        }
    }
}

fn inv_shift_rows(s: &mut [u8; 16]) {
    let t = *s;
    for c in 0..4 {
        for r in 0..4 {
            s[r + 4 * ((c + r) % 4)] = t[r + 4 * c];
        }
    }
}

fn mix_columns(s: &mut [u8; 16]) {
    for col in s.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [col[0], col[1], col[2], col[3]];
        col[0] = gmul(a0, 2) ^ gmul(a1, 3) ^ a2 ^ a3;
        col[1] = a0 ^ gmul(a1, 2) ^ gmul(a2, 3) ^ a3;
        col[2] = a0 ^ a1 ^ gmul(a2, 2) ^ gmul(a3, 3);
        col[3] = gmul(a0, 3) ^ a1 ^ a2 ^ gmul(a3, 2);
    }
}

pub(super) fn inv_mix_columns(s: &mut [u8; 16]) {
    for col in s.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [col[0], col[1], col[2], col[3]];
        col[0] = gmul(a0, 14) ^ gmul(a1, 11) ^ gmul(a2, 13) ^ gmul(a3, 9);
        col[1] = gmul(a0, 9) ^ gmul(a1, 14) ^ gmul(a2, 11) ^ gmul(a3, 13);
        col[2] = gmul(a0, 13) ^ gmul(a1, 9) ^ gmul(a2, 14) ^ gmul(a3, 11);
        col[3] = gmul(a0, 11) ^ gmul(a1, 13) ^ gmul(a2, 9) ^ gmul(a3, 14);
    }
}

fn add_round_key(s: &mut [u8; 16], key: &[u8; 16]) {
    for (b, k) in s.iter_mut().zip(key) {
        *b ^= k;
    }
}

fn encrypt_block(keys: &[[u8; 16]], rounds: usize, s: &mut [u8; 16]) {
    add_round_key(s, &keys[0]);
    for key in &keys[1..rounds] {
        sub_bytes(s);
        shift_rows(s);
        mix_columns(s);
        add_round_key(s, key);
    }
    sub_bytes(s);
    shift_rows(s);
    add_round_key(s, &keys[rounds]);
}

/// Equivalent inverse cipher: `keys` is a decrypt schedule, reversed with
/// InvMixColumns already applied to the inner round keys.
fn decrypt_block(keys: &[[u8; 16]], rounds: usize, s: &mut [u8; 16]) {
    add_round_key(s, &keys[0]);
    for key in &keys[1..rounds] {
        inv_shift_rows(s);
        inv_sub_bytes(s);
        inv_mix_columns(s);
        add_round_key(s, key);
    }
    inv_shift_rows(s);
    inv_sub_bytes(s);
    add_round_key(s, &keys[rounds]);
}

pub(super) fn encrypt_blocks(keys: &[[u8; 16]], rounds: usize, data: &mut [u8]) {
    let mut state = [0u8; 16];
    for block in data.chunks_exact_mut(16) {
        state.copy_from_slice(block);
        encrypt_block(keys, rounds, &mut state);
        block.copy_from_slice(&state);
    }
}

pub(super) fn decrypt_blocks(keys: &[[u8; 16]], rounds: usize, data: &mut [u8]) {
    let mut state = [0u8; 16];
    for block in data.chunks_exact_mut(16) {
        state.copy_from_slice(block);
        decrypt_block(keys, rounds, &mut state);
        block.copy_from_slice(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbox_known_entries() {
        assert_eq!(SBOX[0x00], 0x63);
        assert_eq!(SBOX[0x01], 0x7c);
        assert_eq!(SBOX[0x53], 0xed);
        assert_eq!(SBOX[0xff], 0x16);
        assert_eq!(INV_SBOX[0x63], 0x00);
    }

    #[test]
    fn sbox_is_a_permutation() {
        let mut seen = [false; 256];
        for s in SBOX {
            assert!(!seen[s as usize]);
            seen[s as usize] = true;
        }
    }

    #[test]
    fn mix_columns_known_column() {
        // FIPS-197 section 5.1.3 example column
        let mut s = [0u8; 16];
        s[..4].copy_from_slice(&[0xdb, 0x13, 0x53, 0x45]);
        mix_columns(&mut s);
        assert_eq!(&s[..4], &[0x8e, 0x4d, 0xa1, 0xbc]);
        inv_mix_columns(&mut s);
        assert_eq!(&s[..4], &[0xdb, 0x13, 0x53, 0x45]);
    }

    #[test]
    fn shift_rows_inverts() {
        let mut s: [u8; 16] = core::array::from_fn(|i| i as u8);
        shift_rows(&mut s);
        assert_eq!(s[1], 5);
        inv_shift_rows(&mut s);
        assert_eq!(s, core::array::from_fn(|i| i as u8));
    }
}
