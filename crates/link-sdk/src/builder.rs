//! Builder pattern for constructing a [`Link`].

use std::sync::Arc;
use std::time::Duration;

use dslink_protocol::{Format, Value};

use crate::config::Configuration;
use crate::keypair::{KeyPair, P256KeyPair};
use crate::link::{Link, LinkHandler, NoopHandler};
use crate::platform::Platform;
use crate::types::Result;

/// Fluent builder for [`Link`].
///
/// # Example
///
/// ```rust,no_run
/// # async fn demo() -> dslink_sdk::Result<()> {
/// use dslink_sdk::LinkBuilder;
/// let link = LinkBuilder::new("weather")
///     .broker_url("http://localhost:8080/conn")
///     .keys_folder("./state/")
///     .requester(true)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct LinkBuilder {
    config: Configuration,
    platform: Option<Platform>,
    handler: Option<Arc<dyn LinkHandler>>,
    key_pair: Option<Arc<dyn KeyPair>>,
}

impl LinkBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(Configuration {
            name: name.into(),
            ..Default::default()
        })
    }

    /// Start from a loaded configuration, e.g. one read from TOML.
    pub fn from_config(config: Configuration) -> Self {
        Self {
            config,
            platform: None,
            handler: None,
            key_pair: None,
        }
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Folder for `dslink.keys`.  Must end with a path separator.
    pub fn keys_folder(mut self, folder: impl Into<String>) -> Self {
        self.config.keys_folder = folder.into();
        self
    }

    /// Use a fixed identity instead of loading one from `keys_folder`.
    pub fn key_pair(mut self, key_pair: Arc<dyn KeyPair>) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    // ── Broker ───────────────────────────────────────────────────────

    /// Handshake endpoint (default `http://localhost:8080/conn`).
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Offer only `format` in the handshake.
    pub fn communication_format(mut self, format: Format) -> Self {
        self.config.communication_format = Some(format.as_str().to_string());
        self
    }

    pub fn link_data(mut self, data: Value) -> Self {
        self.config.link_data = data;
        self
    }

    // ── Roles ────────────────────────────────────────────────────────

    pub fn requester(mut self, enabled: bool) -> Self {
        self.config.requester = enabled;
        self
    }

    pub fn responder(mut self, enabled: bool) -> Self {
        self.config.responder = enabled;
        self
    }

    /// Snapshot file for the node tree (default `nodes.json`).
    pub fn nodes_filename(mut self, name: impl Into<String>) -> Self {
        self.config.nodes_filename = name.into();
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Cap on the delay between reconnect attempts (default 60s).
    pub fn max_reconnect_cooldown(mut self, d: Duration) -> Self {
        self.config.max_reconnect_cooldown_secs = d.as_secs();
        self
    }

    /// Give up after `n` consecutive failures.  `0` retries forever.
    pub fn max_connection_attempts(mut self, n: u32) -> Self {
        self.config.max_connection_attempts = n;
        self
    }

    /// Override the heartbeat interval (default 30s).
    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.config.heartbeat_interval_ms = millis(d);
        self
    }

    pub fn queue_flush_delay(mut self, d: Duration) -> Self {
        self.config.queue_flush_delay_ms = millis(d);
        self
    }

    pub fn connection_timeout(mut self, d: Duration) -> Self {
        self.config.connection_timeout_ms = millis(d);
        self
    }

    // ── Collaborators ────────────────────────────────────────────────

    /// Storage and HTTP client.  Defaults to the working directory.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn handler(mut self, handler: impl LinkHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Validate the configuration and load (or create) the key pair.
    pub async fn build(self) -> Result<Link> {
        self.config.validate()?;
        let platform = self.platform.unwrap_or_default();
        let key_pair: Arc<dyn KeyPair> = match self.key_pair {
            Some(key_pair) => key_pair,
            None => Arc::new(
                P256KeyPair::load_or_generate(platform.storage.as_ref(), &self.config.keys_path())
                    .await?,
            ),
        };
        let handler = self.handler.unwrap_or_else(|| Arc::new(NoopHandler));
        Ok(Link::new(self.config, platform, key_pair, handler))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
