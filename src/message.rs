//! The `Message` envelope (spec §3) and its wire-exact JSON schema (spec §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Message kind, serialized as the bit-exact integer enum spec §6 specifies:
/// 0=text, 1=file, 2=image, 3=audio, 4=video, 5=system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    File,
    Image,
    Audio,
    Video,
    System,
}

impl MessageKind {
    fn as_u8(self) -> u8 {
        match self {
            MessageKind::Text => 0,
            MessageKind::File => 1,
            MessageKind::Image => 2,
            MessageKind::Audio => 3,
            MessageKind::Video => 4,
            MessageKind::System => 5,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MessageKind::Text,
            1 => MessageKind::File,
            2 => MessageKind::Image,
            3 => MessageKind::Audio,
            4 => MessageKind::Video,
            5 => MessageKind::System,
            _ => return None,
        })
    }
}

impl Serialize for MessageKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = u8::deserialize(deserializer)?;
        MessageKind::from_u8(v).ok_or_else(|| serde::de::Error::custom(format!("unknown message kind {v}")))
    }
}

/// Base64-in-JSON helper for opaque byte fields (`content`, `signature`),
/// mirroring the teacher's own habit of base64-encoding binary payloads at
/// the JSON boundary (see `crypto::EncryptedEnvelope`, `file_transfer::FileChunk`).
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Immutable envelope carrying text, file-control, or system payloads
/// between peers (spec §3). `signature` covers every other field in the
/// canonical form produced by `codec::canonicalize` (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group_id: Option<String>,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub encrypted: bool,
}

impl Message {
    /// Build an unsigned message with a fresh id and the current timestamp.
    /// `signature` is left empty — callers sign via `codec::sign`.
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: MessageKind, content: Vec<u8>) -> Self {
        Message {
            id: Uuid::new_v4(),
            kind,
            from: from.into(),
            to: to.into(),
            group_id: None,
            content,
            metadata: None,
            timestamp: Utc::now(),
            signature: Vec::new(),
            encrypted: false,
        }
    }
}
