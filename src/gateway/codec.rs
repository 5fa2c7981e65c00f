//! Wire encodings for gateway payloads.
//!
//! The codec is picked once per shard and decides the `encoding=` query parameter of the
//! gateway URL.

use std::fmt::Debug;

use serde_json::Value;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::CodecError;

/// An encoded payload ready to go on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        }
    }
}

pub trait Codec: Send + Sync + Debug {
    /// Value of the `encoding` query parameter.
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Frame, CodecError>;

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError>;

    /// Whether a payload starting with `first` is in this encoding (as opposed to, say, a
    /// zlib stream).
    fn recognizes(&self, first: u8) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Frame, CodecError> {
        Ok(Frame::Text(serde_json::to_string(value)?))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        if data.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(serde_json::from_slice(data)?)
    }

    fn recognizes(&self, first: u8) -> bool {
        first == b'{'
    }
}

/// Compact binary encoding. Payloads are maps, which MessagePack starts with a fixmap, map16 or
/// map32 marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Frame, CodecError> {
        Ok(Frame::Binary(rmp_serde::to_vec_named(value)?))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        if data.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(rmp_serde::from_slice(data)?)
    }

    fn recognizes(&self, first: u8) -> bool {
        matches!(first, 0x80..=0x8f | 0xde | 0xdf)
    }
}
