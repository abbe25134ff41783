//! Link orchestrator: handshake, connect, dispatch, reconnect.

use std::sync::Arc;

use async_trait::async_trait;
use dslink_protocol::{Envelope, Format};
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::connection::{Connection, ConnectionEvent, ConnectionState, Outbound};
use crate::handshake::{self, HandshakeRequest};
use crate::keypair::{self, KeyPair};
use crate::node::Node;
use crate::platform::Platform;
use crate::requester::Requester;
use crate::responder::Responder;
use crate::types::{LinkError, Result};

/// Hooks a link author can implement.  Every method defaults to a no-op.
#[async_trait]
pub trait LinkHandler: Send + Sync + 'static {
    /// Populate the tree when no snapshot could be loaded.
    async fn initialize_default_nodes(&self, _root: &Node) {}

    /// A connection has opened and subscriptions were re-issued.
    async fn on_connected(&self, _link: &Link) {}

    /// The attempt budget ran out; [`Link::run`] is about to return.
    async fn on_connection_failed(&self, _attempts: u32) {}
}

pub(crate) struct NoopHandler;

impl LinkHandler for NoopHandler {}

struct LinkInner {
    config: Configuration,
    platform: Platform,
    key_pair: Arc<dyn KeyPair>,
    ds_id: String,
    handler: Arc<dyn LinkHandler>,
    connection: Arc<Connection>,
    responder: Option<Responder>,
    requester: Option<Requester>,
}

/// A configured link.  Cheap to clone; clones share everything.
///
/// Create via [`LinkBuilder`](crate::builder::LinkBuilder).
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    pub(crate) fn new(
        config: Configuration,
        platform: Platform,
        key_pair: Arc<dyn KeyPair>,
        handler: Arc<dyn LinkHandler>,
    ) -> Self {
        let ds_id = keypair::ds_id(&config.name, &key_pair.public_key_bytes());
        let connection = Connection::new(config.queue_flush_delay());
        let outbound: Arc<dyn Outbound> = connection.clone();
        let responder = config.responder.then(|| Responder::new(outbound.clone()));
        let requester = config.requester.then(|| Requester::new(outbound));
        Self {
            inner: Arc::new(LinkInner {
                config,
                platform,
                key_pair,
                ds_id,
                handler,
                connection,
                responder,
                requester,
            }),
        }
    }

    /// Start a new builder.
    pub fn builder(name: impl Into<String>) -> crate::builder::LinkBuilder {
        crate::builder::LinkBuilder::new(name)
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    pub fn ds_id(&self) -> &str {
        &self.inner.ds_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.inner.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Fails when the link was built with the responder off.
    pub fn responder(&self) -> Result<&Responder> {
        self.inner
            .responder
            .as_ref()
            .ok_or_else(|| LinkError::Config("responder is not enabled".into()))
    }

    /// Fails when the link was built with the requester off.
    pub fn requester(&self) -> Result<&Requester> {
        self.inner
            .requester
            .as_ref()
            .ok_or_else(|| LinkError::Config("requester is not enabled".into()))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Node persistence
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Load the node snapshot, or build the default tree when there is
    /// none.  A no-op without a responder.
    pub async fn initialize(&self) {
        let Some(responder) = &self.inner.responder else {
            return;
        };
        let storage = self.inner.platform.storage.as_ref();
        if !responder
            .deserialize_from_disk(storage, &self.inner.config.nodes_filename)
            .await
        {
            tracing::info!(ds_id = %self.inner.ds_id, "initializing default nodes");
            self.inner
                .handler
                .initialize_default_nodes(responder.root())
                .await;
        }
    }

    pub async fn save_nodes(&self) -> Result<()> {
        self.responder()?
            .serialize_to_disk(
                self.inner.platform.storage.as_ref(),
                &self.inner.config.nodes_filename,
            )
            .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Run loop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Connect and serve until `shutdown` fires.  On disconnection the
    /// whole handshake/connect cycle is retried with back-off.
    ///
    /// Returns [`LinkError::Shutdown`] when cancelled and
    /// [`LinkError::ReconnectExhausted`] when `max_connection_attempts`
    /// consecutive attempts fail.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let backoff = self.inner.config.backoff();
        let ds_id = &self.inner.ds_id;
        let mut failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Err(LinkError::Shutdown);
            }

            let result = tokio::select! {
                r = self.connect_and_run() => r,
                _ = shutdown.cancelled() => {
                    tracing::info!(ds_id = %ds_id, "shutdown requested");
                    self.teardown();
                    return Err(LinkError::Shutdown);
                }
            };

            match result {
                Ok(true) => {
                    tracing::info!(ds_id = %ds_id, "connection closed");
                    failures = 0;
                }
                Ok(false) => {
                    failures += 1;
                    tracing::warn!(ds_id = %ds_id, failures, "connection closed before opening");
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(ds_id = %ds_id, failures, error = %e, "connection attempt failed");
                }
            }

            if backoff.should_give_up(failures) {
                tracing::error!(ds_id = %ds_id, attempts = failures, "max connection attempts exhausted");
                self.inner.handler.on_connection_failed(failures).await;
                return Err(LinkError::ReconnectExhausted(failures));
            }

            let delay = backoff.delay_for_attempt(failures.max(1));
            tracing::info!(
                ds_id = %ds_id,
                delay_ms = delay.as_millis() as u64,
                attempt = failures + 1,
                "reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    return Err(LinkError::Shutdown);
                }
            }
        }
    }

    /// Same as [`run`](Self::run), on a spawned task.
    pub fn spawn(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        let link = self.clone();
        tokio::spawn(async move { link.run(shutdown).await })
    }

    /// One handshake → connect → dispatch cycle.
    ///
    /// `Ok(true)` if the socket opened before it closed.
    async fn connect_and_run(&self) -> Result<bool> {
        let inner = &self.inner;
        let config = &inner.config;

        // ── Handshake ────────────────────────────────────────────────
        let mut request = HandshakeRequest::new(
            inner.key_pair.encoded_public_key(),
            config.requester,
            config.responder,
            &config.offered_formats(),
        );
        request.link_data = config.link_data.clone();
        let token = config
            .token
            .as_deref()
            .map(|t| keypair::create_token(t, &inner.ds_id));

        tracing::info!(broker = %config.broker_url, ds_id = %inner.ds_id, "handshaking");
        let descriptor = handshake::shake(
            &inner.platform.http,
            &config.broker_url,
            &inner.ds_id,
            token.as_deref(),
            &request,
        )
        .await
        .ok_or_else(|| LinkError::Handshake("no broker descriptor".into()))?;

        let auth = match (&descriptor.temp_key, &descriptor.salt) {
            (Some(temp_key), Some(salt)) => {
                let secret = inner.key_pair.derive_shared_secret(temp_key)?;
                Some(keypair::auth_param(salt, &secret))
            }
            _ => None,
        };
        let format = descriptor
            .negotiated_format()
            .or(config.format_override()?)
            .unwrap_or(Format::Json);
        let url = handshake::websocket_url(
            &config.broker_url,
            &descriptor,
            auth.as_deref(),
            &inner.ds_id,
            format,
            token.as_deref(),
        )?;

        // ── Connect ──────────────────────────────────────────────────
        // Queued now, flushed as soon as the socket opens.
        if let Some(requester) = &inner.requester {
            requester.resubscribe();
        }
        let mut events = inner
            .connection
            .connect(&url, format.serializer(), config.connection_timeout())
            .await?;

        let heartbeat = CancellationToken::new();
        let _heartbeat_guard = heartbeat.clone().drop_guard();
        let mut opened = false;

        // ── Event loop ───────────────────────────────────────────────
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Open => {
                    opened = true;
                    tracing::info!(ds_id = %inner.ds_id, format = %format, "connected to broker");
                    self.spawn_heartbeat(heartbeat.clone());
                    inner.handler.on_connected(self).await;
                }
                ConnectionEvent::Message(envelope) => self.dispatch(envelope),
                ConnectionEvent::Close => break,
            }
        }

        heartbeat.cancel();
        self.clear_registrations();
        Ok(opened)
    }

    fn dispatch(&self, envelope: Envelope) {
        let inner = &self.inner;
        if let Some(msg) = envelope.msg {
            inner.connection.write(
                Envelope {
                    ack: Some(msg),
                    ..Default::default()
                },
                true,
            );
        }

        if !envelope.requests.is_empty() {
            match &inner.responder {
                Some(responder) => {
                    if let Err(e) = responder.process_requests(envelope.requests) {
                        tracing::error!(ds_id = %inner.ds_id, error = %e, "request batch aborted");
                    }
                }
                None => tracing::debug!("ignoring requests: responder disabled"),
            }
        }

        if !envelope.responses.is_empty() {
            match &inner.requester {
                Some(requester) => requester.process_responses(envelope.responses),
                None => tracing::debug!("ignoring responses: requester disabled"),
            }
        }
    }

    fn spawn_heartbeat(&self, cancel: CancellationToken) {
        let connection = self.inner.connection.clone();
        let interval = self.inner.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !connection.is_connected() {
                            break;
                        }
                        tracing::trace!("heartbeat");
                        connection.write(Envelope::default(), false);
                    }
                }
            }
        });
    }

    fn clear_registrations(&self) {
        if let Some(responder) = &self.inner.responder {
            responder.clear_registrations();
        }
        if let Some(requester) = &self.inner.requester {
            requester.clear_pending();
        }
    }

    fn teardown(&self) {
        self.inner.connection.disconnect();
        self.clear_registrations();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use dslink_protocol::Value;

    use super::*;
    use crate::builder::LinkBuilder;

    #[derive(Default)]
    struct Recorder {
        defaults: AtomicUsize,
        failed: AtomicU32,
    }

    #[async_trait]
    impl LinkHandler for Arc<Recorder> {
        async fn initialize_default_nodes(&self, root: &Node) {
            self.defaults.fetch_add(1, Ordering::SeqCst);
            let _ = root.create_child("greeting").map(|b| b.value("hello").build());
        }

        async fn on_connection_failed(&self, attempts: u32) {
            self.failed.store(attempts, Ordering::SeqCst);
        }
    }

    async fn link(dir: &std::path::Path, recorder: Arc<Recorder>) -> Link {
        LinkBuilder::new("test")
            .broker_url("http://127.0.0.1:1/conn")
            .platform(Platform::local(dir))
            .handler(recorder)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn disabled_roles_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let link = link(dir.path(), Arc::default()).await;
        assert!(link.responder().is_ok());
        assert!(matches!(link.requester(), Err(LinkError::Config(_))));
    }

    #[tokio::test]
    async fn initialize_falls_back_then_loads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());

        let first = link(dir.path(), recorder.clone()).await;
        first.initialize().await;
        assert_eq!(recorder.defaults.load(Ordering::SeqCst), 1);
        first.save_nodes().await.unwrap();

        let second = link(dir.path(), recorder.clone()).await;
        second.initialize().await;
        assert_eq!(recorder.defaults.load(Ordering::SeqCst), 1);
        let greeting = second.responder().unwrap().get("/greeting").unwrap();
        assert_eq!(greeting.value().get(), Value::from("hello"));
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let link = LinkBuilder::new("test")
            .broker_url("http://127.0.0.1:1/conn")
            .max_connection_attempts(2)
            .platform(Platform::local(dir.path()))
            .handler(recorder.clone())
            .build()
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), link.run(CancellationToken::new()))
            .await
            .expect("run should give up");
        assert!(matches!(result, Err(LinkError::ReconnectExhausted(2))));
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let link = link(dir.path(), Arc::default()).await;
        let shutdown = CancellationToken::new();
        let handle = link.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(LinkError::Shutdown)));
    }
}
