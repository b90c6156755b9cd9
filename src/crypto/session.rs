//! SessionCrypto (spec §4.2): X3DH key agreement, per-message AEAD keyed off
//! a chain key, and the sliding nonce-replay window.

use crate::crypto::primitives::{aead_open, aead_seal, dh, hkdf, KeyPair, NONCE_LEN};
use crate::error::{Result, XelvraError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use zeroize::ZeroizeOnDrop;

/// Default replay window: 5 minutes (spec §4.2).
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// A remote peer's published pre-key material, fetched once per handshake.
#[derive(Debug, Clone)]
pub struct X3DHBundle {
    pub identity_key: [u8; 32],
    pub signed_prekey: [u8; 32],
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey: Option<[u8; 32]>,
}

/// Reserved for the full Double Ratchet (spec §3, §9): present in the data
/// model, not wired into `SessionCrypto`'s current per-message path, which
/// derives message keys straight off a static chain key. A full ratchet
/// implementation would replace `SessionCrypto::chain_key` with this.
#[derive(Debug, Clone)]
pub struct DoubleRatchetState {
    pub root_key: [u8; 32],
    pub chain_key: [u8; 32],
    pub sending_public: Option<[u8; 32]>,
    pub receiving_public: Option<[u8; 32]>,
    pub message_number: u64,
    pub previous_chain_length: u64,
}

/// Sliding nonce-replay window, keyed by hex-encoded nonce. Entries older
/// than `window` are evicted lazily, on every check (spec §4.2).
pub struct NonceWindow {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl NonceWindow {
    pub fn new(window: Duration) -> Self {
        NonceWindow { window, seen: HashMap::new() }
    }

    fn evict_expired(&mut self) {
        let window = self.window;
        let now = Instant::now();
        self.seen.retain(|_, first_seen| now.duration_since(*first_seen) < window);
    }

    /// Reject if `nonce` is already present; never mutates the table on
    /// rejection (the caller marks success separately via `mark_used`).
    pub fn check(&mut self, nonce: &[u8]) -> Result<()> {
        self.evict_expired();
        if self.seen.contains_key(&hex::encode(nonce)) {
            return Err(XelvraError::NonceReplay);
        }
        Ok(())
    }

    pub fn mark_used(&mut self, nonce: &[u8]) {
        self.seen.insert(hex::encode(nonce), Instant::now());
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Run X3DH from the local side: three ECDH outputs combined in the fixed
/// order `(DH1, DH2, DH3)`, which both peers MUST agree on. No DH4 (one-time
/// prekey consumption) is performed — when a bundle carries one, callers may
/// extend this, but both sides must agree not to silently diverge (spec §4.2).
pub fn x3dh(
    local_identity: &KeyPair,
    local_ephemeral: &KeyPair,
    remote_bundle: &X3DHBundle,
) -> Result<[u8; 32]> {
    let dh1 = dh(local_identity.private_bytes(), &remote_bundle.signed_prekey)
        .map_err(|_| XelvraError::HandshakeFailed { step: 1 })?;
    let dh2 = dh(local_ephemeral.private_bytes(), &remote_bundle.identity_key)
        .map_err(|_| XelvraError::HandshakeFailed { step: 2 })?;
    let dh3 = dh(local_ephemeral.private_bytes(), &remote_bundle.signed_prekey)
        .map_err(|_| XelvraError::HandshakeFailed { step: 3 })?;

    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);

    let shared = hkdf(&ikm, None, b"XelvraX3DH", 32);
    let mut out = [0u8; 32];
    out.copy_from_slice(&shared);
    Ok(out)
}

/// Per-session crypto state: the established chain key and its nonce-replay
/// window. `chain_key` is zeroed on drop; `destroy` forces that immediately
/// and clears the nonce table, matching the spec's scoped-acquisition
/// requirement that every exit path destroys secret material.
#[derive(ZeroizeOnDrop)]
pub struct SessionCrypto {
    chain_key: [u8; 32],
    #[zeroize(skip)]
    nonce_window: Mutex<NonceWindow>,
}

impl SessionCrypto {
    pub fn new(chain_key: [u8; 32]) -> Self {
        SessionCrypto {
            chain_key,
            nonce_window: Mutex::new(NonceWindow::new(DEFAULT_REPLAY_WINDOW)),
        }
    }

    pub fn from_x3dh(
        local_identity: &KeyPair,
        local_ephemeral: &KeyPair,
        remote_bundle: &X3DHBundle,
    ) -> Result<Self> {
        Ok(Self::new(x3dh(local_identity, local_ephemeral, remote_bundle)?))
    }

    /// `EncryptMessage`: derive a fresh message key from the chain key and
    /// AEAD-seal. Each call draws a fresh random nonce (spec §4.1, §4.2).
    pub fn encrypt_message(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let message_key = self.message_key();
        aead_seal(&message_key, plaintext)
    }

    /// `DecryptMessage`: extract the leading nonce, run the replay check,
    /// derive the same message key, AEAD-open, and only on success mark the
    /// nonce used. A replayed valid ciphertext is caught before decryption;
    /// a bogus ciphertext can never poison the nonce table (spec §4.2).
    pub fn decrypt_message(&self, wire: &[u8]) -> Result<Vec<u8>> {
        if wire.len() < NONCE_LEN {
            return Err(XelvraError::DecryptFailed);
        }
        let nonce = &wire[..NONCE_LEN];
        {
            let mut window = self.nonce_window.lock().expect("nonce window mutex poisoned");
            window.check(nonce)?;
        }
        let message_key = self.message_key();
        let plaintext = aead_open(&message_key, wire)?;
        {
            let mut window = self.nonce_window.lock().expect("nonce window mutex poisoned");
            window.mark_used(nonce);
        }
        Ok(plaintext)
    }

    fn message_key(&self) -> [u8; 32] {
        let derived = hkdf(&self.chain_key, None, b"XelvraMessageKey", 32);
        let mut key = [0u8; 32];
        key.copy_from_slice(&derived);
        key
    }

    /// Explicit, immediate destruction: zeros the chain key and clears the
    /// nonce table. Equivalent to dropping `self`, spelled out for callers
    /// that want the scoped-destruction contract to be visible at the call site.
    pub fn destroy(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::primitives::generate_keypair;

    fn bundle_for(identity: &KeyPair, signed_prekey: &KeyPair) -> X3DHBundle {
        X3DHBundle {
            identity_key: identity.public(),
            signed_prekey: signed_prekey.public(),
            signed_prekey_signature: Vec::new(),
            one_time_prekey: None,
        }
    }

    #[test]
    fn x3dh_is_symmetric_between_both_sides() {
        let x_identity = generate_keypair().unwrap();
        let x_signed_prekey = generate_keypair().unwrap();
        let x_ephemeral = generate_keypair().unwrap();

        let y_identity = generate_keypair().unwrap();
        let y_signed_prekey = generate_keypair().unwrap();
        let y_ephemeral = generate_keypair().unwrap();

        // X runs the handshake against Y's bundle using X's ephemeral key.
        let y_bundle = bundle_for(&y_identity, &y_signed_prekey);
        let secret_from_x = x3dh(&x_identity, &x_ephemeral, &y_bundle).unwrap();

        // Y mirrors it: DH1 = DH(Y's signed-prekey priv, X's identity pub),
        // DH2 = DH(Y's identity priv, X's ephemeral pub),
        // DH3 = DH(Y's signed-prekey priv, X's ephemeral pub).
        let dh1 = dh(y_signed_prekey.private_bytes(), &x_identity.public()).unwrap();
        let dh2 = dh(y_identity.private_bytes(), &x_ephemeral.public()).unwrap();
        let dh3 = dh(y_signed_prekey.private_bytes(), &x_ephemeral.public()).unwrap();
        let mut ikm = Vec::new();
        ikm.extend_from_slice(&dh1);
        ikm.extend_from_slice(&dh2);
        ikm.extend_from_slice(&dh3);
        let secret_from_y = hkdf(&ikm, None, b"XelvraX3DH", 32);

        assert_eq!(secret_from_x.to_vec(), secret_from_y);
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let session = SessionCrypto::new([9u8; 32]);
        let plaintext = b"hello";
        let wire = session.encrypt_message(plaintext).unwrap();
        let decrypted = session.decrypt_message(&wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn replayed_ciphertext_is_rejected() {
        let session = SessionCrypto::new([3u8; 32]);
        let wire = session.encrypt_message(b"hello").unwrap();
        assert_eq!(session.decrypt_message(&wire).unwrap(), b"hello");
        let err = session.decrypt_message(&wire).unwrap_err();
        assert!(matches!(err, XelvraError::NonceReplay));
    }

    #[test]
    fn a_failed_decrypt_does_not_poison_the_nonce_table() {
        let session = SessionCrypto::new([5u8; 32]);
        let mut wire = session.encrypt_message(b"hello").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF; // corrupt the tag, decrypt must fail
        assert!(session.decrypt_message(&wire).is_err());
        // The nonce must not have been marked used by the failed attempt.
        assert_eq!(session.nonce_window.lock().unwrap().len(), 0);
    }

    #[test]
    fn nonce_window_evicts_entries_older_than_the_window() {
        let mut window = NonceWindow::new(Duration::from_millis(0));
        window.mark_used(b"abc");
        assert_eq!(window.len(), 1);
        // A zero-length window means every entry is immediately stale.
        assert!(window.check(b"abc").is_ok());
    }
}
