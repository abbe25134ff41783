//! Link configuration.
//!
//! Loadable from TOML (every field has a default) or assembled through
//! [`LinkBuilder`](crate::builder::LinkBuilder).  Immutable once the link
//! is built.

use std::path::Path;
use std::time::Duration;

use dslink_protocol::{Format, Value};
use serde::{Deserialize, Serialize};

use crate::node::validate_name;
use crate::reconnect::ReconnectBackoff;
use crate::types::{LinkError, Result};

/// Name of the key file inside `keys_folder`.
pub const KEYS_FILENAME: &str = "dslink.keys";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Link name; prefix of the derived ds id.
    #[serde(default = "d_name")]
    pub name: String,
    #[serde(default)]
    pub requester: bool,
    #[serde(default = "d_true")]
    pub responder: bool,
    /// Handshake endpoint, e.g. `http://localhost:8080/conn`.
    #[serde(default = "d_broker_url")]
    pub broker_url: String,
    /// Folder holding the key file.  Must end with a path separator when set.
    #[serde(default)]
    pub keys_folder: String,
    #[serde(default = "d_nodes_filename")]
    pub nodes_filename: String,
    #[serde(default)]
    pub token: Option<String>,
    /// `"json"` or `"msgpack"`; unset means let the broker choose.
    #[serde(default)]
    pub communication_format: Option<String>,
    #[serde(default = "d_60")]
    pub max_reconnect_cooldown_secs: u64,
    /// `0` means retry forever.
    #[serde(default)]
    pub max_connection_attempts: u32,
    #[serde(default = "d_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "d_5")]
    pub queue_flush_delay_ms: u64,
    #[serde(default = "d_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Free-form map forwarded as `linkData` in the handshake.
    #[serde(default = "Value::map")]
    pub link_data: Value,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: d_name(),
            requester: false,
            responder: true,
            broker_url: d_broker_url(),
            keys_folder: String::new(),
            nodes_filename: d_nodes_filename(),
            token: None,
            communication_format: None,
            max_reconnect_cooldown_secs: 60,
            max_connection_attempts: 0,
            heartbeat_interval_ms: 30_000,
            queue_flush_delay_ms: 5,
            connection_timeout_ms: 10_000,
            link_data: Value::map(),
        }
    }
}

impl Configuration {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations that can never work.  Called by the builder.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LinkError::Config("name is required".into()));
        }
        validate_name(&self.name)
            .map_err(|_| LinkError::Config(format!("name {:?} contains a banned character", self.name)))?;
        if !self.keys_folder.is_empty()
            && !(self.keys_folder.ends_with('/') || self.keys_folder.ends_with('\\'))
        {
            return Err(LinkError::Config(format!(
                "keys_folder {:?} must end with a path separator",
                self.keys_folder
            )));
        }
        if !self.requester && !self.responder {
            return Err(LinkError::Config(
                "at least one of requester/responder must be enabled".into(),
            ));
        }
        reqwest::Url::parse(&self.broker_url)
            .map_err(|e| LinkError::Config(format!("broker_url {:?}: {e}", self.broker_url)))?;
        if self.heartbeat_interval_ms == 0 {
            return Err(LinkError::Config("heartbeat_interval_ms must be positive".into()));
        }
        if self.connection_timeout_ms == 0 {
            return Err(LinkError::Config("connection_timeout_ms must be positive".into()));
        }
        self.format_override()?;
        Ok(())
    }

    /// Parsed `communication_format`.
    pub fn format_override(&self) -> Result<Option<Format>> {
        match &self.communication_format {
            None => Ok(None),
            Some(name) => Format::parse(name)
                .map(Some)
                .ok_or_else(|| LinkError::Config(format!("unknown communication_format {name:?}"))),
        }
    }

    /// Formats to offer in the handshake.
    pub fn offered_formats(&self) -> Vec<Format> {
        match self.format_override() {
            Ok(Some(format)) => vec![format],
            _ => Format::supported().to_vec(),
        }
    }

    /// Storage name of the key file.
    pub fn keys_path(&self) -> String {
        format!("{}{KEYS_FILENAME}", self.keys_folder)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn queue_flush_delay(&self) -> Duration {
        Duration::from_millis(self.queue_flush_delay_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff {
            max_delay: Duration::from_secs(self.max_reconnect_cooldown_secs),
            max_attempts: self.max_connection_attempts,
            ..Default::default()
        }
    }
}

fn d_name() -> String {
    "dslink-rust".into()
}
fn d_true() -> bool {
    true
}
fn d_broker_url() -> String {
    "http://localhost:8080/conn".into()
}
fn d_nodes_filename() -> String {
    "nodes.json".into()
}
fn d_60() -> u64 {
    60
}
fn d_heartbeat_ms() -> u64 {
    30_000
}
fn d_timeout_ms() -> u64 {
    10_000
}
fn d_5() -> u64 {
    5
}
