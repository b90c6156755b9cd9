//! Wire framing and signed-envelope canonicalization (spec §4.3).
//!
//! Every frame, in both directions and for every protocol, is a 4-byte
//! big-endian length header followed by exactly that many payload bytes.
//! The read path here always uses `read_exact` for both the length prefix
//! and the payload — the spec explicitly flags the source's single-shot
//! reads as a bug a conforming implementation must not repeat (spec §9).

use crate::error::{Result, XelvraError};
use crate::identity::{verify as identity_verify, Identity, KeyDirectory};
use crate::message::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload for text/system-kind frames (spec §4.3).
pub const TEXT_FRAME_MAX: u32 = 64 * 1024;
/// Maximum payload for file-control frames (request/accept/reject/complete) —
/// these never carry chunk data, so the spec's "single small cap" applies
/// (spec §4.3). Checked against the decoded frame, not the wire read itself,
/// since a `chunk` frame shares the same stream and JSON envelope.
pub const FILE_CONTROL_FRAME_MAX: u32 = 4 * 1024;
/// Maximum payload for file-protocol frames in general, sized to fit a
/// base64-encoded `chunk_size`-bounded chunk (`file_transfer::MAX_CHUNK_SIZE`,
/// ~4/3 expansion) plus JSON/envelope overhead. The file stream's
/// `read_frame` call always uses this limit; non-chunk frame types are then
/// checked against the tighter `FILE_CONTROL_FRAME_MAX` after decoding.
pub const FILE_CHUNK_FRAME_MAX: u32 = 96 * 1024;

const LENGTH_HEADER_BYTES: usize = 4;

/// Encode `payload` as a length-prefixed frame. A payload whose length is
/// `>= max_len` is rejected: the limit bounds frames strictly below the
/// named cap (a 64 KiB limit accepts up to 65535 payload bytes), matching
/// the wire test vectors in spec §8 (a 64000-byte payload is accepted, a
/// 65536-byte payload — exactly 64 KiB — is rejected).
pub fn encode_frame(payload: &[u8], max_len: u32) -> Result<Vec<u8>> {
    if payload.len() as u64 >= max_len as u64 {
        return Err(XelvraError::FrameTooLarge { len: payload.len() as u32, max: max_len });
    }
    let mut out = Vec::with_capacity(LENGTH_HEADER_BYTES + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read one length-prefixed frame from `reader`, rejecting lengths `>= max_len`
/// before attempting to read the payload.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: u32) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; LENGTH_HEADER_BYTES];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len >= max_len {
        return Err(XelvraError::FrameTooLarge { len, max: max_len });
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write a length-prefixed frame to `writer`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8], max_len: u32) -> Result<()> {
    let frame = encode_frame(payload, max_len)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Canonical bytes signed over and verified: the JSON serialization of a
/// `Message` with `signature` omitted, in the fixed field order
/// `id, kind, from, to, group_id (if present), content, metadata (if present), timestamp`.
///
/// Serializing field-by-field (rather than relying on a struct's derived
/// `Serialize`, which would include `signature`) guarantees both peers
/// produce byte-identical output regardless of serializer internals.
pub fn canonicalize(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(msg.id.as_bytes());
    buf.push(0);
    buf.push(match msg.kind {
        crate::message::MessageKind::Text => 0,
        crate::message::MessageKind::File => 1,
        crate::message::MessageKind::Image => 2,
        crate::message::MessageKind::Audio => 3,
        crate::message::MessageKind::Video => 4,
        crate::message::MessageKind::System => 5,
    });
    buf.push(0);
    buf.extend_from_slice(msg.from.as_bytes());
    buf.push(0);
    buf.extend_from_slice(msg.to.as_bytes());
    buf.push(0);
    if let Some(group_id) = &msg.group_id {
        buf.extend_from_slice(group_id.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&msg.content);
    buf.push(0);
    if let Some(metadata) = &msg.metadata {
        // `Message.metadata` is a `HashMap`, whose iteration (and therefore
        // `serde_json::to_vec`) order is randomized per-process — sort
        // through a `BTreeMap` first so both peers always emit the same
        // key order, or the canonical bytes (and the signature over them)
        // would diverge between sender and verifier.
        let sorted: std::collections::BTreeMap<&String, &serde_json::Value> = metadata.iter().collect();
        if let Ok(bytes) = serde_json::to_vec(&sorted) {
            buf.extend_from_slice(&bytes);
        }
    }
    buf.push(0);
    buf.extend_from_slice(msg.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true).as_bytes());
    buf
}

/// Sign `msg` in place using `identity`, setting its `signature` field.
pub async fn sign(identity: &dyn Identity, msg: &mut Message) {
    let canonical = canonicalize(msg);
    msg.signature = identity.sign(&canonical).await;
}

/// Verify `msg.signature` against the sender's key in `directory`.
/// Returns `SignatureInvalid` both when the sender is unknown and when the
/// signature fails to verify — the caller MUST drop the envelope either way.
pub fn verify(msg: &Message, directory: &dyn KeyDirectory) -> Result<()> {
    let key = directory.lookup(&msg.from).ok_or(XelvraError::SignatureInvalid)?;
    let canonical = canonicalize(msg);
    if identity_verify(&key, &canonical, &msg.signature) {
        Ok(())
    } else {
        Err(XelvraError::SignatureInvalid)
    }
}

/// Serialize a `Message` to the wire JSON schema (spec §6).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Deserialize a `Message` from wire JSON.
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_at_boundary() {
        let payload = vec![0xABu8; 64000];
        let frame = encode_frame(&payload, TEXT_FRAME_MAX).unwrap();
        assert_eq!(frame.len(), 64004);
        assert_eq!(&frame[..4], &[0x00, 0x00, 0xFA, 0x00]);
        assert_eq!(&frame[4..], payload.as_slice());
    }

    #[test]
    fn frame_at_exact_limit_is_rejected() {
        let payload = vec![0u8; 65536];
        let err = encode_frame(&payload, TEXT_FRAME_MAX).unwrap_err();
        assert!(matches!(err, XelvraError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn read_frame_round_trips_through_a_pipe() {
        let payload = vec![7u8; 1024];
        let frame = encode_frame(&payload, TEXT_FRAME_MAX).unwrap();
        let mut cursor = std::io::Cursor::new(frame);
        let decoded = read_frame(&mut cursor, TEXT_FRAME_MAX).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn sign_then_verify_succeeds_and_tamper_fails() {
        use crate::identity::{Ed25519Identity, InMemoryKeyDirectory};
        use crate::message::{Message, MessageKind};

        let identity = Ed25519Identity::generate("did:xelvra:alice");
        let directory = InMemoryKeyDirectory::new();
        directory.register("did:xelvra:alice", identity.verifying_key());

        let mut msg = Message::new("did:xelvra:alice", "did:xelvra:bob", MessageKind::Text, b"hi".to_vec());
        sign(&identity, &mut msg).await;
        assert!(verify(&msg, &directory).is_ok());

        msg.content = b"tampered".to_vec();
        assert!(verify(&msg, &directory).is_err());
    }

    #[test]
    fn canonicalize_is_order_independent_for_metadata_keys() {
        use crate::message::{Message, MessageKind};
        use std::collections::HashMap;

        let mut a = Message::new("did:xelvra:alice", "did:xelvra:bob", MessageKind::Text, b"hi".to_vec());
        let mut fields_a = HashMap::new();
        fields_a.insert("zebra".to_string(), serde_json::json!(1));
        fields_a.insert("alpha".to_string(), serde_json::json!(2));
        fields_a.insert("mid".to_string(), serde_json::json!(3));
        a.metadata = Some(fields_a);

        let mut b = a.clone();
        let mut fields_b = HashMap::new();
        fields_b.insert("alpha".to_string(), serde_json::json!(2));
        fields_b.insert("mid".to_string(), serde_json::json!(3));
        fields_b.insert("zebra".to_string(), serde_json::json!(1));
        b.metadata = Some(fields_b);

        // Same logical metadata, different `HashMap` insertion order: the
        // canonical bytes (and therefore the signature) must still match.
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[tokio::test]
    async fn sign_then_verify_succeeds_with_metadata_present() {
        use crate::identity::{Ed25519Identity, InMemoryKeyDirectory};
        use crate::message::{Message, MessageKind};
        use std::collections::HashMap;

        let identity = Ed25519Identity::generate("did:xelvra:alice");
        let directory = InMemoryKeyDirectory::new();
        directory.register("did:xelvra:alice", identity.verifying_key());

        let mut msg = Message::new("did:xelvra:alice", "did:xelvra:bob", MessageKind::Text, b"hi".to_vec());
        let mut fields = HashMap::new();
        fields.insert("retry_count".to_string(), serde_json::json!(2));
        fields.insert("priority".to_string(), serde_json::json!("high"));
        msg.metadata = Some(fields);

        sign(&identity, &mut msg).await;
        assert!(verify(&msg, &directory).is_ok());
    }

    #[test]
    fn unknown_sender_fails_verification() {
        use crate::identity::InMemoryKeyDirectory;
        use crate::message::{Message, MessageKind};

        let directory = InMemoryKeyDirectory::new();
        let msg = Message::new("did:xelvra:ghost", "did:xelvra:bob", MessageKind::Text, b"hi".to_vec());
        assert!(verify(&msg, &directory).is_err());
    }
}
