//! HTTP handshake with the broker.
//!
//! One POST per connection attempt.  A failed handshake is logged and
//! reported as `None`; retrying is the link's business.

use dslink_protocol::{Format, Value};
use serde::{Deserialize, Serialize};

use crate::types::{LinkError, Result};

pub use dslink_protocol::PROTOCOL_VERSION;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub public_key: String,
    pub is_requester: bool,
    pub is_responder: bool,
    pub link_data: Value,
    pub version: String,
    pub formats: Vec<String>,
    pub enable_web_socket_compression: bool,
}

impl HandshakeRequest {
    pub fn new(public_key: String, requester: bool, responder: bool, formats: &[Format]) -> Self {
        Self {
            public_key,
            is_requester: requester,
            is_responder: responder,
            link_data: Value::map(),
            version: PROTOCOL_VERSION.to_string(),
            formats: formats.iter().map(|f| f.as_str().to_string()).collect(),
            enable_web_socket_compression: false,
        }
    }
}

/// What the broker answers with.  Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerDescriptor {
    pub ds_id: Option<String>,
    pub public_key: Option<String>,
    pub ws_uri: Option<String>,
    pub http_uri: Option<String>,
    pub temp_key: Option<String>,
    pub salt: Option<String>,
    pub format: Option<String>,
    pub update_interval: Option<i64>,
    pub path: Option<String>,
    pub version: Option<String>,
}

impl BrokerDescriptor {
    /// Format the broker picked, if it named one we speak.
    pub fn negotiated_format(&self) -> Option<Format> {
        self.format.as_deref().and_then(Format::parse)
    }
}

/// POST the handshake body to `broker_url`.
pub async fn shake(
    http: &reqwest::Client,
    broker_url: &str,
    ds_id: &str,
    token: Option<&str>,
    request: &HandshakeRequest,
) -> Option<BrokerDescriptor> {
    match try_shake(http, broker_url, ds_id, token, request).await {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            tracing::warn!(broker = %broker_url, ds_id = %ds_id, error = %e, "handshake failed");
            None
        }
    }
}

async fn try_shake(
    http: &reqwest::Client,
    broker_url: &str,
    ds_id: &str,
    token: Option<&str>,
    request: &HandshakeRequest,
) -> Result<BrokerDescriptor> {
    let mut url = reqwest::Url::parse(broker_url)
        .map_err(|e| LinkError::Handshake(format!("bad broker url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("dsId", ds_id);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }

    tracing::debug!(url = %url, "sending handshake");
    let response = http
        .post(url)
        .json(request)
        .send()
        .await
        .map_err(|e| LinkError::Handshake(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(LinkError::Handshake(format!("broker returned {status}")));
    }
    let body = response
        .text()
        .await
        .map_err(|e| LinkError::Handshake(e.to_string()))?;
    let descriptor: BrokerDescriptor = serde_json::from_str(&body)
        .map_err(|e| LinkError::Handshake(format!("malformed descriptor: {e}")))?;
    tracing::debug!(broker_ds_id = ?descriptor.ds_id, format = ?descriptor.format, "handshake accepted");
    Ok(descriptor)
}

/// WebSocket URL for a successful handshake: the broker URL with its
/// scheme switched to `ws`/`wss` and its path replaced by `wsUri`.
pub fn websocket_url(
    broker_url: &str,
    descriptor: &BrokerDescriptor,
    auth: Option<&str>,
    ds_id: &str,
    format: Format,
    token: Option<&str>,
) -> Result<String> {
    let ws_uri = descriptor
        .ws_uri
        .as_deref()
        .ok_or_else(|| LinkError::Handshake("descriptor has no wsUri".into()))?;
    let mut url = reqwest::Url::parse(broker_url)
        .map_err(|e| LinkError::Handshake(format!("bad broker url: {e}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| LinkError::Handshake(format!("cannot use scheme {scheme}")))?;
    url.set_path(ws_uri);
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        if let Some(auth) = auth {
            query.append_pair("auth", auth);
        }
        query.append_pair("dsId", ds_id);
        query.append_pair("format", format.as_str());
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    Ok(url.to_string())
}
