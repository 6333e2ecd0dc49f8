//! The wire message envelope and pre-key bundle types.
//!
//! Frames travel as JSON text. The relay parses only the routing metadata;
//! `content` is carried as raw JSON and re-emitted byte-for-byte.

use crate::{Identity, WireError};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A routed message.
///
/// `from` is stamped by the relay from the sending connection's identity;
/// any client-supplied value is overwritten before routing. `to` must parse
/// as a canonical `user_id:device_id` identity or the frame is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Application-defined message kind. Opaque to the relay.
    #[serde(rename = "type")]
    pub kind: String,
    /// Canonical identity of the sender. Relay-stamped.
    #[serde(default)]
    pub from: String,
    /// Canonical identity of the recipient.
    pub to: String,
    /// Opaque payload, passed through without re-encoding.
    pub content: Box<RawValue>,
}

impl Frame {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Serialization)
    }

    /// Serialize to a JSON string, the form text transports carry.
    pub fn to_text(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Overwrite `from` with the actual sender's identity.
    pub fn stamp_from(&mut self, sender: &Identity) {
        self.from = sender.as_key();
    }

    /// Parse `to` into a recipient identity.
    pub fn recipient(&self) -> Result<Identity, WireError> {
        self.to.parse()
    }
}

/// Key material published by a device for session establishment.
///
/// Opaque to the relay: stored and returned verbatim, never interpreted.
/// Byte fields are base64 strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    /// Long-term identity public key.
    #[serde(with = "b64")]
    pub identity_key: Vec<u8>,
    /// Signed pre-key.
    #[serde(with = "b64")]
    pub signed_pre_key: Vec<u8>,
    /// Signature over the signed pre-key.
    #[serde(with = "b64")]
    pub signed_pre_key_signature: Vec<u8>,
    /// One-time pre-key.
    #[serde(with = "b64")]
    pub one_time_pre_key: Vec<u8>,
    /// Device registration id.
    pub registration_id: u32,
}

impl PreKeyBundle {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
