//! Envelope wire format shared by client connections and the broker.
//!
//! The same encoded bytes travel the whole path:
//! ```text
//! client ──frame──► gateway ──record──► broker ──record──► gateway ──frame──► clients
//!         (bytes)            (bytes)             (bytes)             (bytes)
//! ```
//! The gateway decodes an envelope only to validate it and read `roomId`;
//! what it forwards is always the original byte sequence.
//!
//! Two encodings are supported:
//!
//! | Format    | Frame  | Layout                                          |
//! |-----------|--------|-------------------------------------------------|
//! | `json`    | text   | `{"roomId": 42, "payload": "hello"}`            |
//! | `bincode` | binary | varint room id, length-prefixed payload bytes   |

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Room identifier supplied by the connecting peer.
pub type RoomId = i64;

/// Query parameter carrying the room id on the upgrade request.
pub const ROOM_PARAM: &str = "room";

/// A comment addressed to one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    /// Opaque to the gateway. Carried as a string in JSON, raw bytes otherwise.
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(room_id: RoomId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            room_id,
            payload: payload.into(),
        }
    }
}

/// Encoding used for envelopes on both the client and broker side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Bincode,
}

impl WireFormat {
    /// Serialize an envelope.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Json => {
                serde_json::to_vec(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
            }
            Self::Bincode => bincode::serde::encode_to_vec(envelope, bincode::config::standard())
                .map_err(|e| ProtocolError::Encode(e.to_string())),
        }
    }

    /// Deserialize an envelope.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        match self {
            Self::Json => {
                serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
            Self::Bincode => {
                let (envelope, read) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
                if read != bytes.len() {
                    return Err(ProtocolError::TrailingBytes(bytes.len() - read));
                }
                Ok(envelope)
            }
        }
    }

    /// Wrap already-encoded envelope bytes in the WebSocket frame kind
    /// this format travels in.
    pub fn frame(&self, bytes: Bytes) -> Result<Message, ProtocolError> {
        match self {
            Self::Json => Utf8Bytes::try_from(bytes)
                .map(Message::Text)
                .map_err(|_| ProtocolError::NotUtf8),
            Self::Bincode => Ok(Message::Binary(bytes)),
        }
    }
}

/// Reasons a connection is refused before it is registered anywhere.
///
/// The message text is sent verbatim to the peer as a final text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// `room` parameter missing or not an integer.
    IncorrectRoomId,
    /// `room` parsed but no such room is provisioned.
    RoomDoesNotExist,
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Self::IncorrectRoomId => "incorrect roomId.",
            Self::RoomDoesNotExist => "Room does not exist.",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("Payload is not valid UTF-8")]
    NotUtf8,
}

/// Payload as a UTF-8 string for human-readable formats, raw bytes otherwise.
mod payload_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            let text = std::str::from_utf8(bytes).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(text)
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            String::deserialize(deserializer).map(String::into_bytes)
        } else {
            deserializer.deserialize_byte_buf(BytesVisitor)
        }
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a byte buffer")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}
