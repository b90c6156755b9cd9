//! CryptoPrimitives (spec §4.1): Curve25519 keypairs, ECDH, HKDF-SHA256,
//! and AES-256-GCM AEAD. AES-GCM was picked for hardware acceleration;
//! HKDF-SHA256 is the simplest combiner for the multi-DH X3DH secret.

use crate::error::{Result, XelvraError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use std::time::Instant;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// An owned Curve25519 keypair. The private half is zeroed on drop —
/// `#[zeroize(skip)]` on `public`/`created_at` keeps `ZeroizeOnDrop` from
/// touching fields that carry no secret material.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    private: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
    #[zeroize(skip)]
    created_at: Instant,
}

impl KeyPair {
    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    pub fn private_bytes(&self) -> &[u8; 32] {
        &self.private
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// Curve25519 clamping: clear the low 3 bits of byte 0, clear the top bit
/// and set bit 6 of byte 31 (spec §3).
fn clamp_scalar(bytes: &mut [u8; 32]) {
    bytes[0] &= 0xF8;
    bytes[31] &= 0x7F;
    bytes[31] |= 0x40;
}

/// Draw 32 random bytes, clamp them, and derive the matching public key.
pub fn generate_keypair() -> Result<KeyPair> {
    let mut private = [0u8; 32];
    OsRng.try_fill_bytes(&mut private).map_err(|_| XelvraError::RandomSourceUnavailable)?;
    clamp_scalar(&mut private);
    let secret = StaticSecret::from(private);
    let public = PublicKey::from(&secret).to_bytes();
    Ok(KeyPair { private, public, created_at: Instant::now() })
}

/// X25519 Diffie-Hellman. Rejects non-32-byte inputs and all-zero (contributory
/// low-order point) outputs, which would indicate an invalid remote point.
pub fn dh(private: &[u8], public: &[u8]) -> Result<[u8; 32]> {
    let private: [u8; 32] = private.try_into().map_err(|_| XelvraError::InvalidKeySize(private.len()))?;
    let public: [u8; 32] = public.try_into().map_err(|_| XelvraError::InvalidKeySize(public.len()))?;
    let secret = StaticSecret::from(private);
    let remote = PublicKey::from(public);
    let shared = secret.diffie_hellman(&remote);
    if shared.as_bytes() == &[0u8; 32] {
        return Err(XelvraError::InvalidPoint);
    }
    Ok(*shared.as_bytes())
}

/// HKDF-SHA256 extract-then-expand.
pub fn hkdf(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm).expect("HKDF output length is always valid for SHA-256");
    okm
}

/// AES-256-GCM seal. Returns `nonce (12 bytes) ‖ ciphertext_with_tag`.
pub fn aead_seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| XelvraError::InvalidKeySize(key.len()))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| XelvraError::DecryptFailed)?;
    let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    wire.extend_from_slice(&nonce_bytes);
    wire.extend_from_slice(&ciphertext);
    Ok(wire)
}

/// AES-256-GCM open. Expects `wire` to be at least `NONCE_LEN + TAG_LEN` bytes.
pub fn aead_open(key: &[u8; KEY_LEN], wire: &[u8]) -> Result<Vec<u8>> {
    if wire.len() < NONCE_LEN + TAG_LEN {
        return Err(XelvraError::DecryptFailed);
    }
    let (nonce_bytes, ciphertext) = wire.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| XelvraError::InvalidKeySize(key.len()))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher.decrypt(nonce, ciphertext).map_err(|_| XelvraError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_clamped() {
        let kp = generate_keypair().unwrap();
        let priv_bytes = kp.private_bytes();
        assert_eq!(priv_bytes[0] & 0x07, 0);
        assert_eq!(priv_bytes[31] & 0x80, 0);
        assert_eq!(priv_bytes[31] & 0x40, 0x40);
    }

    #[test]
    fn dh_is_symmetric_and_nonzero() {
        let a = generate_keypair().unwrap();
        let b = generate_keypair().unwrap();
        let shared_ab = dh(a.private_bytes(), &b.public()).unwrap();
        let shared_ba = dh(b.private_bytes(), &a.public()).unwrap();
        assert_eq!(shared_ab, shared_ba);
        assert_eq!(shared_ab.len(), 32);
        assert_ne!(shared_ab, [0u8; 32]);
    }

    #[test]
    fn dh_rejects_wrong_sized_input() {
        let a = generate_keypair().unwrap();
        let err = dh(&a.private_bytes()[..16], &a.public()).unwrap_err();
        assert!(matches!(err, XelvraError::InvalidKeySize(16)));
    }

    #[test]
    fn aead_round_trip() {
        let key = [0x42u8; 32];
        let plaintext = b"hello, secure world";
        let wire = aead_seal(&key, plaintext).unwrap();
        assert_eq!(&wire[..NONCE_LEN].len(), &NONCE_LEN);
        let opened = aead_open(&key, &wire).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn aead_open_rejects_tampered_ciphertext() {
        let key = [0x11u8; 32];
        let mut wire = aead_seal(&key, b"payload").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(aead_open(&key, &wire).is_err());
    }

    #[test]
    fn key_pair_zeroes_private_bytes_on_drop() {
        // Drop in place through a raw pointer so we can observe the backing
        // memory immediately afterward without a second, real drop running.
        let mut kp = Box::new(generate_keypair().unwrap());
        let ptr = kp.private_bytes().as_ptr();
        let len = kp.private_bytes().len();
        unsafe {
            std::ptr::drop_in_place(kp.as_mut() as *mut KeyPair);
            let after = std::slice::from_raw_parts(ptr, len);
            assert_eq!(after, &[0u8; 32]);
        }
        std::mem::forget(kp);
    }
}
