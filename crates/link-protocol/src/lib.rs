//! `dslink-protocol`: wire types for the DSA link protocol.
//!
//! A link talks to its broker with envelopes of the form
//!
//! ```text
//! { "msg": 12, "ack": 7,
//!   "requests":  [ { "rid": 1, "method": "list", "path": "/" } ],
//!   "responses": [ { "rid": 0, "updates": [[3, 42, "2024-01-01T00:00:00.000+00:00"]] } ] }
//! ```
//!
//! encoded as JSON text frames or MessagePack binary frames.  This crate
//! holds the value model, the typed request/response views over envelope
//! entries, and the two codecs.  It performs no I/O.

pub mod envelope;
pub mod error;
pub mod permission;
pub mod serializer;
pub mod timestamp;
pub mod value;

pub use envelope::{
    Column, Envelope, Method, Request, Response, StreamState, SubscribePath, SubscriptionUpdate,
};
pub use error::ProtocolError;
pub use permission::Permission;
pub use serializer::{Format, Frame, JsonSerializer, MsgPackSerializer, Serializer};
pub use timestamp::{format_timestamp, now, parse_timestamp, Timestamp, TIMESTAMP_FORMAT};
pub use value::{decode_bytes, encode_bytes, Value, BYTES_PREFIX};

/// Protocol version announced during the handshake.
pub const PROTOCOL_VERSION: &str = "1.1.2";
