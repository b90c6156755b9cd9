//! Identity: the abstract signing capability the engine consumes (spec §6).
//!
//! `Identity` is owned by the embedding application — this crate never
//! constructs one on its own behalf. `KeyDirectory` resolves a sender's
//! decentralized identifier to the public key needed to verify their
//! signature; the spec (§4.3, §9) flags this lookup as an external
//! responsibility the source left unresolved, so it is modeled here as a
//! trait with no production implementation, only the in-memory test double
//! used by this crate's own tests.

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use std::collections::HashMap;
use std::sync::RwLock;

/// `Sign(bytes) -> signature`, `DID() -> string` (spec §6).
#[async_trait]
pub trait Identity: Send + Sync {
    fn did(&self) -> &str;
    async fn sign(&self, bytes: &[u8]) -> Vec<u8>;
}

/// Resolves a DID to the Ed25519 public key it signs with.
pub trait KeyDirectory: Send + Sync {
    fn lookup(&self, did: &str) -> Option<VerifyingKey>;
}

/// Ed25519-backed `Identity`, used by this crate's own tests and available
/// to embedders that don't already have a signing capability of their own.
pub struct Ed25519Identity {
    did: String,
    signing_key: SigningKey,
}

impl Ed25519Identity {
    pub fn generate(did: impl Into<String>) -> Self {
        let mut csprng = rand_core::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Ed25519Identity { did: did.into(), signing_key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

#[async_trait]
impl Identity for Ed25519Identity {
    fn did(&self) -> &str {
        &self.did
    }

    async fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.signing_key.sign(bytes).to_bytes().to_vec()
    }
}

/// In-memory `KeyDirectory`, suitable for tests and single-process demos.
#[derive(Default)]
pub struct InMemoryKeyDirectory {
    keys: RwLock<HashMap<String, VerifyingKey>>,
}

impl InMemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, did: impl Into<String>, key: VerifyingKey) {
        self.keys.write().unwrap().insert(did.into(), key);
    }
}

impl KeyDirectory for InMemoryKeyDirectory {
    fn lookup(&self, did: &str) -> Option<VerifyingKey> {
        self.keys.read().unwrap().get(did).copied()
    }
}

/// Verify a signature produced by `Identity::sign` against a known key.
pub fn verify(key: &VerifyingKey, bytes: &[u8], signature: &[u8]) -> bool {
    let sig = match ed25519_dalek::Signature::from_slice(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    key.verify(bytes, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_and_verify_round_trip() {
        let identity = Ed25519Identity::generate("did:xelvra:alice");
        let bytes = b"canonical message bytes";
        let sig = identity.sign(bytes).await;
        assert!(verify(&identity.verifying_key(), bytes, &sig));
    }

    #[tokio::test]
    async fn tampered_bytes_fail_verification() {
        let identity = Ed25519Identity::generate("did:xelvra:alice");
        let sig = identity.sign(b"hello").await;
        assert!(!verify(&identity.verifying_key(), b"goodbye", &sig));
    }
}
