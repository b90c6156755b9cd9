//! Cryptographic primitives and per-session state (spec §4.1, §4.2).

pub mod primitives;
pub mod session;

pub use primitives::{aead_open, aead_seal, dh, generate_keypair, hkdf, KeyPair, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use session::{x3dh, DoubleRatchetState, NonceWindow, SessionCrypto, X3DHBundle, DEFAULT_REPLAY_WINDOW};
