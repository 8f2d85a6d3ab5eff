//! Cryptographic primitives (C1): AEAD box, password KDF, keyed hash, random
//! bytes. This is the single source of randomness and cryptographic
//! transforms for the rest of the crate — nothing else calls into `argon2`,
//! `chacha20poly1305`, `blake3` or `rand` directly.

use crate::error::{Result, VaultError};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;

/// Fresh cryptographically secure random bytes (salts, nonces, blob ids).
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut b = [0u8; N];
    rand::thread_rng().fill_bytes(&mut b);
    b
}

/// Derive a 32-byte key-wrapping key from a low-entropy PIN. Deterministic
/// given `(pin, salt, m_cost_kib, t_cost)`; deliberately slow (Argon2id).
pub fn kdf(pin: &str, salt: &[u8; SALT_LEN], m_cost_kib: u32, t_cost: u32) -> Result<[u8; KEY_LEN]> {
    let params = Params::new(m_cost_kib, t_cost, 1, Some(KEY_LEN))
        .map_err(|_| VaultError::CryptoFailure)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(pin.as_bytes(), salt, &mut out)
        .map_err(|_| VaultError::CryptoFailure)?;
    Ok(out)
}

/// Authenticated encryption. `nonce` MUST be used at most once per `key`.
pub fn aead_seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad: b"" })
        .map_err(|_| VaultError::CryptoFailure)
}

/// Inverse of [`aead_seal`]. Fails with the single opaque [`VaultError::CryptoFailure`]
/// on any authentication failure; callers must not branch on sub-reasons.
pub fn aead_open(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: b"" })
        .map_err(|_| VaultError::CryptoFailure)
}

/// Content fingerprint for dedup. Keyed with a fixed domain-separation
/// context so the hash can't be computed by an attacker without the master
/// key, yet is still collision-resistant and deterministic across imports.
pub fn keyed_hash(master_key: &[u8; KEY_LEN], data: &[u8]) -> [u8; 32] {
    let fingerprint_key = hkdf_derive(master_key, b"content-fingerprint").unwrap_or([0u8; KEY_LEN]);
    blake3::keyed_hash(&fingerprint_key, data).into()
}

/// Derive a 32-byte key from the master key plus a domain-separation label.
/// Used for per-block keys (`"block:" || block_salt`), per-file keys, and
/// the shared name-sealing key (`"names"`).
pub fn hkdf_derive(master_key: &[u8; KEY_LEN], info: &[u8]) -> Result<[u8; KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(None, master_key);
    let mut out = [0u8; KEY_LEN];
    hk.expand(info, &mut out).map_err(|_| VaultError::CryptoFailure)?;
    Ok(out)
}

/// Per-block key derivation: `keyed_hash(master_key || block_salt, 32)`,
/// expressed via HKDF so the key never depends on the AEAD key directly.
pub fn block_key(master_key: &[u8; KEY_LEN], block_salt: &[u8; SALT_LEN]) -> Result<[u8; KEY_LEN]> {
    let mut info = Vec::with_capacity(6 + SALT_LEN);
    info.extend_from_slice(b"block:");
    info.extend_from_slice(block_salt);
    hkdf_derive(master_key, &info)
}

/// Keyed-hash fingerprint of the master key itself, used as a PIN-correct
/// verifier stored alongside the wrapped key. Keyed (not a bare content
/// hash) so the stored fingerprint doesn't double as an oracle for guessing
/// the master key outside of a successful unwrap.
pub fn master_key_verifier(master_key: &[u8; KEY_LEN]) -> Result<[u8; 32]> {
    let verifier_key = hkdf_derive(master_key, b"master-key-verifier")?;
    Ok(blake3::keyed_hash(&verifier_key, b"securevault-verifier").into())
}

pub fn zeroize_vec(mut v: Vec<u8>) {
    v.zeroize();
}

pub fn zeroize_key(key: &mut [u8; KEY_LEN]) {
    key.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trips() {
        let key = random_bytes::<KEY_LEN>();
        let nonce = random_bytes::<NONCE_LEN>();
        let pt = b"hello vault";
        let ct = aead_seal(&key, &nonce, pt).unwrap();
        assert_eq!(aead_open(&key, &nonce, &ct).unwrap(), pt);
    }

    #[test]
    fn aead_open_rejects_tampering() {
        let key = random_bytes::<KEY_LEN>();
        let nonce = random_bytes::<NONCE_LEN>();
        let mut ct = aead_seal(&key, &nonce, b"hello vault").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(matches!(aead_open(&key, &nonce, &ct), Err(VaultError::CryptoFailure)));
    }

    #[test]
    fn kdf_is_deterministic() {
        let salt = random_bytes::<SALT_LEN>();
        let a = kdf("1234", &salt, 19 * 1024, 2).unwrap();
        let b = kdf("1234", &salt, 19 * 1024, 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn kdf_differs_on_wrong_pin() {
        let salt = random_bytes::<SALT_LEN>();
        let a = kdf("1234", &salt, 19 * 1024, 2).unwrap();
        let b = kdf("9999", &salt, 19 * 1024, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn keyed_hash_is_deterministic_and_content_sensitive() {
        let mk = random_bytes::<KEY_LEN>();
        let h1 = keyed_hash(&mk, b"abc");
        let h2 = keyed_hash(&mk, b"abc");
        let h3 = keyed_hash(&mk, b"abd");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn master_key_verifier_is_deterministic_and_key_sensitive() {
        let a = random_bytes::<KEY_LEN>();
        let b = random_bytes::<KEY_LEN>();
        assert_eq!(master_key_verifier(&a).unwrap(), master_key_verifier(&a).unwrap());
        assert_ne!(master_key_verifier(&a).unwrap(), master_key_verifier(&b).unwrap());
    }
}
