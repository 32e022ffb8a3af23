//! Header key derivation: credential + salt + parameters into key bytes.

use std::fmt;

use serde::Serialize;
use sha2::Sha512;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::argon2::{self, Variant};
use crate::crypto::keyfile::{Keyfile, apply_keyfiles};
use crate::crypto::{HEADER_KEY_LEN, SALT_LEN};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    /// Iterated HMAC-SHA512, kept for volumes created before Argon2.
    Pbkdf2Sha512,
    Argon2d,
    Argon2i,
    Argon2id,
}

impl KdfAlgorithm {
    pub fn id(self) -> u8 {
        match self {
            KdfAlgorithm::Pbkdf2Sha512 => 1,
            KdfAlgorithm::Argon2d => 2,
            KdfAlgorithm::Argon2i => 3,
            KdfAlgorithm::Argon2id => 4,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(KdfAlgorithm::Pbkdf2Sha512),
            2 => Some(KdfAlgorithm::Argon2d),
            3 => Some(KdfAlgorithm::Argon2i),
            4 => Some(KdfAlgorithm::Argon2id),
            _ => None,
        }
    }

    fn argon2_variant(self) -> Option<Variant> {
        match self {
            KdfAlgorithm::Pbkdf2Sha512 => None,
            KdfAlgorithm::Argon2d => Some(Variant::Argon2d),
            KdfAlgorithm::Argon2i => Some(Variant::Argon2i),
            KdfAlgorithm::Argon2id => Some(Variant::Argon2id),
        }
    }
}

impl fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KdfAlgorithm::Pbkdf2Sha512 => "pbkdf2-sha512",
            KdfAlgorithm::Argon2d => "argon2d",
            KdfAlgorithm::Argon2i => "argon2i",
            KdfAlgorithm::Argon2id => "argon2id",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KdfParams {
    algorithm: KdfAlgorithm,
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            // 64 MiB
            mem_cost_kib: 64 * 1024,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub fn new(
        algorithm: KdfAlgorithm,
        mem_cost_kib: u32,
        time_cost: u32,
        parallelism: u32,
    ) -> Result<Self> {
        let params = Self {
            algorithm,
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn argon2id(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        Self::new(KdfAlgorithm::Argon2id, mem_cost_kib, time_cost, parallelism)
    }

    /// Legacy parameters: only the iteration count is meaningful.
    pub fn pbkdf2(iterations: u32) -> Result<Self> {
        Self::new(KdfAlgorithm::Pbkdf2Sha512, 0, iterations, 1)
    }

    pub fn algorithm(&self) -> KdfAlgorithm {
        self.algorithm
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn time_cost(&self) -> u32 {
        self.time_cost
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_cost < 1 {
            return Err(Error::InvalidParams("time cost must be >= 1".into()));
        }
        if self.algorithm.argon2_variant().is_some() {
            if self.parallelism < 1 || self.parallelism > argon2::MAX_LANES {
                return Err(Error::InvalidParams(format!(
                    "parallelism {} out of range",
                    self.parallelism
                )));
            }
            if (self.mem_cost_kib as u64) < 8 * self.parallelism as u64 {
                return Err(Error::InvalidParams(
                    "memory cost must be at least 8 * parallelism".into(),
                ));
            }
        }
        Ok(())
    }

    /// `true` when these parameters should be replaced by `recommended`.
    ///
    /// The legacy algorithm and the non-hybrid Argon2 variants are always
    /// outdated, as are memory or pass counts below the recommendation.
    pub fn is_outdated(&self, recommended: &KdfParams) -> bool {
        self.algorithm != KdfAlgorithm::Argon2id
            || self.mem_cost_kib < recommended.mem_cost_kib
            || self.time_cost < recommended.time_cost
    }
}

impl fmt::Display for KdfParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.algorithm {
            KdfAlgorithm::Pbkdf2Sha512 => {
                write!(f, "{} ({} iterations)", self.algorithm, self.time_cost)
            }
            _ => write!(
                f,
                "{} (m={} KiB, t={}, p={})",
                self.algorithm, self.mem_cost_kib, self.time_cost, self.parallelism
            ),
        }
    }
}

/// Password plus ordered keyfiles. Everything is wiped on drop.
pub struct Credential {
    password: Zeroizing<Vec<u8>>,
    keyfiles: Vec<Keyfile>,
}

impl Credential {
    pub fn new(password: Zeroizing<Vec<u8>>, keyfiles: Vec<Keyfile>) -> Self {
        Self { password, keyfiles }
    }

    pub fn from_password(password: &str) -> Self {
        Self::new(Zeroizing::new(password.as_bytes().to_vec()), Vec::new())
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }

    pub fn keyfiles(&self) -> &[Keyfile] {
        &self.keyfiles
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("password", &"[REDACTED]")
            .field("keyfiles", &self.keyfiles)
            .finish()
    }
}

/// Key material that seals a header: an XTS AES-256 key pair.
pub struct HeaderKey(Zeroizing<[u8; HEADER_KEY_LEN]>);

impl HeaderKey {
    pub fn as_bytes(&self) -> &[u8; HEADER_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HeaderKey([REDACTED])")
    }
}

/// The pre-Argon2 iterated KDF.
pub trait LegacyKdf {
    fn derive(&self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pbkdf2Sha512;

impl LegacyKdf for Pbkdf2Sha512 {
    fn derive(&self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()> {
        pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, out);
        Ok(())
    }
}

pub fn derive_header_key(credential: &Credential, salt: &[u8], params: KdfParams) -> Result<HeaderKey> {
    derive_header_key_with(&Pbkdf2Sha512, credential, salt, params, None)
}

/// Derives the header key, with an explicit legacy KDF and Argon2 worker count.
///
/// `threads` defaults to [`argon2::default_threads`] and never changes the output.
pub fn derive_header_key_with(
    legacy: &dyn LegacyKdf,
    credential: &Credential,
    salt: &[u8],
    params: KdfParams,
    threads: Option<u32>,
) -> Result<HeaderKey> {
    params.validate()?;
    let secret = apply_keyfiles(credential.password(), credential.keyfiles())?;
    let mut key = Zeroizing::new([0u8; HEADER_KEY_LEN]);

    debug!(%params, keyfiles = credential.keyfiles().len(), "deriving header key");
    match params.algorithm.argon2_variant() {
        Some(variant) => {
            let argon = argon2::Params::new(
                variant,
                params.mem_cost_kib,
                params.time_cost,
                params.parallelism,
            )?;
            let argon = match threads {
                Some(threads) => argon.with_threads(threads),
                None => argon,
            };
            argon2::hash(&argon, &secret, salt, &mut key[..])?;
        }
        None => legacy.derive(&secret, salt, params.time_cost, &mut key[..])?,
    }
    Ok(HeaderKey(key))
}

/// Fills `buf` from the OS generator.
pub fn random_bytes(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|_| Error::Random)
}

pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    random_bytes(&mut salt)?;
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> KdfParams {
        KdfParams::argon2id(64, 1, 2).unwrap()
    }

    #[test]
    fn kdf_is_deterministic() {
        let salt = [42u8; SALT_LEN];
        let cred = Credential::from_password("password");

        let k1 = derive_header_key(&cred, &salt, small()).unwrap();
        let k2 = derive_header_key(&cred, &salt, small()).unwrap();

        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn kdf_params_affect_output() {
        let salt = [7u8; SALT_LEN];
        let cred = Credential::from_password("pw");

        let k1 = derive_header_key(&cred, &salt, KdfParams::argon2id(64, 2, 1).unwrap()).unwrap();
        let k2 = derive_header_key(&cred, &salt, KdfParams::argon2id(128, 2, 1).unwrap()).unwrap();
        let k3 = derive_header_key(
            &cred,
            &salt,
            KdfParams::new(KdfAlgorithm::Argon2d, 64, 2, 1).unwrap(),
        )
        .unwrap();

        assert_ne!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn thread_count_does_not_change_key() {
        let salt = [1u8; SALT_LEN];
        let cred = Credential::from_password("pw");
        let params = KdfParams::argon2id(128, 1, 4).unwrap();

        let single = derive_header_key_with(&Pbkdf2Sha512, &cred, &salt, params, Some(1)).unwrap();
        let multi = derive_header_key_with(&Pbkdf2Sha512, &cred, &salt, params, Some(4)).unwrap();
        assert_eq!(single.as_bytes(), multi.as_bytes());
    }

    #[test]
    fn keyfiles_change_the_key() {
        let salt = [3u8; SALT_LEN];
        let plain = Credential::from_password("pw");
        let with_keyfile = Credential::new(
            Zeroizing::new(b"pw".to_vec()),
            vec![Keyfile::from_bytes("k", b"keyfile bytes".to_vec())],
        );

        let a = derive_header_key(&plain, &salt, small()).unwrap();
        let b = derive_header_key(&with_keyfile, &salt, small()).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn keyfile_order_changes_the_key() {
        let salt = [3u8; SALT_LEN];
        let keyfiles = |order: [&[u8]; 2]| {
            let files = order
                .iter()
                .enumerate()
                .map(|(i, data)| Keyfile::from_bytes(format!("k{i}"), data.to_vec()))
                .collect();
            Credential::new(Zeroizing::new(b"pw".to_vec()), files)
        };
        let first: &[u8] = b"first keyfile";
        let second: &[u8] = b"second keyfile contents";

        let forward = derive_header_key(&keyfiles([first, second]), &salt, small()).unwrap();
        let again = derive_header_key(&keyfiles([first, second]), &salt, small()).unwrap();
        let reversed = derive_header_key(&keyfiles([second, first]), &salt, small()).unwrap();

        assert_eq!(forward.as_bytes(), again.as_bytes());
        assert_ne!(forward.as_bytes(), reversed.as_bytes());
    }

    #[test]
    fn wide_parallelism_derives_without_thread_per_lane() {
        // a header may ask for far more lanes than the host has cores
        let params = KdfParams::argon2id(8 * 2048, 1, 2048).unwrap();
        let salt = [5u8; SALT_LEN];
        let cred = Credential::from_password("pw");

        let default = derive_header_key(&cred, &salt, params).unwrap();
        let single = derive_header_key_with(&Pbkdf2Sha512, &cred, &salt, params, Some(1)).unwrap();
        assert_eq!(default.as_bytes(), single.as_bytes());
    }

    #[test]
    fn pbkdf2_matches_known_vector() {
        let cred = Credential::from_password("password");
        let key = derive_header_key(&cred, b"salt", KdfParams::pbkdf2(1).unwrap()).unwrap();
        let expected = "867f70cf1ade02cff3752599a3a53dc4af34c7a669815ae5d513554e1c8cf252\
                        c02d470a285a0501bad999bfe943c08f050235d7d68b1da55e63f73b60a57fce";
        let hex: String = key.as_bytes().iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, expected);
    }

    struct Recording(std::cell::Cell<u32>);

    impl LegacyKdf for Recording {
        fn derive(&self, _: &[u8], _: &[u8], iterations: u32, out: &mut [u8]) -> Result<()> {
            self.0.set(iterations);
            out.fill(0xab);
            Ok(())
        }
    }

    #[test]
    fn legacy_kdf_is_pluggable() {
        let legacy = Recording(std::cell::Cell::new(0));
        let cred = Credential::from_password("pw");
        let key = derive_header_key_with(&legacy, &cred, b"salt", KdfParams::pbkdf2(500).unwrap(), None)
            .unwrap();
        assert_eq!(legacy.0.get(), 500);
        assert!(key.as_bytes().iter().all(|&b| b == 0xab));
    }

    #[test]
    fn kdf_invalid_params_fail_gracefully() {
        assert!(KdfParams::argon2id(0, 0, 0).is_err());
        assert!(KdfParams::argon2id(16, 1, 4).is_err());
        assert!(KdfParams::pbkdf2(0).is_err());
        assert!(KdfParams::pbkdf2(1000).is_ok());
    }

    #[test]
    fn outdated_detection() {
        let recommended = KdfParams::default();
        assert!(!recommended.is_outdated(&recommended));
        assert!(KdfParams::pbkdf2(500_000).unwrap().is_outdated(&recommended));
        assert!(
            KdfParams::new(KdfAlgorithm::Argon2i, 1 << 20, 10, 4)
                .unwrap()
                .is_outdated(&recommended)
        );
        assert!(KdfParams::argon2id(32 * 1024, 3, 4).unwrap().is_outdated(&recommended));
        assert!(KdfParams::argon2id(64 * 1024, 2, 4).unwrap().is_outdated(&recommended));
        assert!(!KdfParams::argon2id(128 * 1024, 4, 1).unwrap().is_outdated(&recommended));
    }

    #[test]
    fn algorithm_ids_roundtrip() {
        for alg in [
            KdfAlgorithm::Pbkdf2Sha512,
            KdfAlgorithm::Argon2d,
            KdfAlgorithm::Argon2i,
            KdfAlgorithm::Argon2id,
        ] {
            assert_eq!(KdfAlgorithm::from_id(alg.id()), Some(alg));
        }
        assert_eq!(KdfAlgorithm::from_id(0), None);
        assert_eq!(KdfAlgorithm::from_id(9), None);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let cred = Credential::from_password("hunter2");
        assert!(!format!("{cred:?}").contains("hunter2"));
        let key = derive_header_key(&cred, &[0u8; SALT_LEN], small()).unwrap();
        assert_eq!(format!("{key:?}"), "HeaderKey([REDACTED])");
    }
}
