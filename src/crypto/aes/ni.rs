//! AES-NI rounds for x86_64.

use core::arch::x86_64::{
    __m128i, _mm_aesdec_si128, _mm_aesdeclast_si128, _mm_aesenc_si128, _mm_aesenclast_si128,
    _mm_loadu_si128, _mm_storeu_si128, _mm_xor_si128,
};

/// # Safety
///
/// The CPU must support AES-NI. `keys` must hold at least `rounds + 1` keys
/// and `data.len()` must be a multiple of 16.
#[target_feature(enable = "aes")]
pub(super) unsafe fn encrypt_blocks(keys: &[[u8; 16]], rounds: usize, data: &mut [u8]) {
    for block in data.chunks_exact_mut(16) {
        // SAFETY: unaligned loads and stores of exactly 16 bytes.
        unsafe {
            let mut s = _mm_loadu_si128(block.as_ptr().cast::<__m128i>());
            s = _mm_xor_si128(s, load(&keys[0]));
            for key in &keys[1..rounds] {
                s = _mm_aesenc_si128(s, load(key));
            }
            s = _mm_aesenclast_si128(s, load(&keys[rounds]));
            _mm_storeu_si128(block.as_mut_ptr().cast::<__m128i>(), s);
        }
    }
}

/// # Safety
///
/// Same contract as [`encrypt_blocks`]; `keys` is a decrypt schedule.
#[target_feature(enable = "aes")]
pub(super) unsafe fn decrypt_blocks(keys: &[[u8; 16]], rounds: usize, data: &mut [u8]) {
    for block in data.chunks_exact_mut(16) {
        // SAFETY: unaligned loads and stores of exactly 16 bytes.
        unsafe {
            let mut s = _mm_loadu_si128(block.as_ptr().cast::<__m128i>());
            s = _mm_xor_si128(s, load(&keys[0]));
            for key in &keys[1..rounds] {
                s = _mm_aesdec_si128(s, load(key));
            }
            s = _mm_aesdeclast_si128(s, load(&keys[rounds]));
            _mm_storeu_si128(block.as_mut_ptr().cast::<__m128i>(), s);
        }
    }
}

#[inline(always)]
unsafe fn load(key: &[u8; 16]) -> __m128i {
    // SAFETY: `key` is 16 readable bytes.
    unsafe { _mm_loadu_si128(key.as_ptr().cast::<__m128i>()) }
}
