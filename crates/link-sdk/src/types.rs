//! SDK error types.

use dslink_protocol::{ProtocolError, Value};

/// Errors an action handler can return.
///
/// The responder translates these into a closed invoke stream carrying an
/// `error` object, the way the broker expects failed invocations to look.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ActionError {
    #[error("invalid_params: {0}")]
    InvalidParams(String),
    #[error("permission_denied: {0}")]
    NotAllowed(String),
    #[error("failed: {0}")]
    Failed(String),
}

impl ActionError {
    /// Protocol `error` object: `{type, msg}`.
    pub fn to_value(&self) -> Value {
        let (kind, msg) = match self {
            ActionError::InvalidParams(m) => ("invalidParameter", m),
            ActionError::NotAllowed(m) => ("permissionDenied", m),
            ActionError::Failed(m) => ("serverError", m),
        };
        protocol_error(kind, msg)
    }
}

impl From<LinkError> for ActionError {
    fn from(e: LinkError) -> Self {
        ActionError::Failed(e.to_string())
    }
}

/// Build an `{type, msg}` error object.
pub(crate) fn protocol_error(kind: &str, msg: &str) -> Value {
    let mut v = Value::map();
    v.insert("type", kind);
    v.insert("msg", msg);
    v
}

/// Top-level SDK error.
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error("config: {0}")]
    Config(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("key: {0}")]
    Key(String),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("not connected")]
    NotConnected,
    #[error("invalid node name: {0:?}")]
    InvalidNodeName(String),
    #[error("duplicate child: {0}")]
    DuplicateChild(String),
    #[error("unknown subscription: {0}")]
    UnknownSubscription(i64),
    #[error("request {0} closed")]
    RequestClosed(i64),
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("shutdown")]
    Shutdown,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
