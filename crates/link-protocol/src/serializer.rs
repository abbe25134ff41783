//! Pluggable envelope codecs.
//!
//! JSON travels as text frames, MessagePack as binary frames.  The two
//! differ in exactly one place: JSON has no binary type, so
//! [`Value::Bytes`](crate::Value::Bytes) is carried as an escaped base64
//! string and comes back as bytes only when the string carries the escape.

use std::fmt;
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::error::{ProtocolError, Result};

/// One WebSocket payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }
}

/// Negotiable communication formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Json,
    MsgPack,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::MsgPack => "msgpack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Some(Format::Json),
            "msgpack" => Some(Format::MsgPack),
            _ => None,
        }
    }

    /// Formats offered in the handshake, preferred first.
    pub fn supported() -> [Format; 2] {
        [Format::MsgPack, Format::Json]
    }

    pub fn serializer(&self) -> Arc<dyn Serializer> {
        match self {
            Format::Json => Arc::new(JsonSerializer),
            Format::MsgPack => Arc::new(MsgPackSerializer),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encodes and decodes whole envelopes.
pub trait Serializer: Send + Sync {
    fn format(&self) -> Format;
    fn serialize(&self, envelope: &Envelope) -> Result<Frame>;
    fn deserialize(&self, frame: &Frame) -> Result<Envelope>;
}

// ── JSON ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn format(&self) -> Format {
        Format::Json
    }

    fn serialize(&self, envelope: &Envelope) -> Result<Frame> {
        Ok(Frame::Text(serde_json::to_string(envelope)?))
    }

    fn deserialize(&self, frame: &Frame) -> Result<Envelope> {
        // Some brokers send JSON in binary frames.
        Ok(match frame {
            Frame::Text(text) => serde_json::from_str(text)?,
            Frame::Binary(bytes) => serde_json::from_slice(bytes)?,
        })
    }
}

// ── MessagePack ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn format(&self) -> Format {
        Format::MsgPack
    }

    fn serialize(&self, envelope: &Envelope) -> Result<Frame> {
        // Named: the envelope must be a map on the wire, not a tuple.
        Ok(Frame::Binary(rmp_serde::to_vec_named(envelope)?))
    }

    fn deserialize(&self, frame: &Frame) -> Result<Envelope> {
        match frame {
            Frame::Binary(bytes) => Ok(rmp_serde::from_slice(bytes)?),
            other => Err(ProtocolError::FrameMismatch {
                format: "msgpack",
                frame: other.kind(),
            }),
        }
    }
}
