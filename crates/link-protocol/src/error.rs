/// Errors raised while encoding, decoding or interpreting protocol traffic.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("{format} cannot decode a {frame} frame")]
    FrameMismatch {
        format: &'static str,
        frame: &'static str,
    },

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("malformed: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
