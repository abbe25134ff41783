//! WebSocket transport with envelope queueing.
//!
//! One [`Connection`] lives as long as its link and is reused across
//! reconnects.  Outbound envelopes either go straight to the socket or are
//! merged into a single pending envelope that a short-delay task flushes.
//! Value updates have their own buffer so rapid changes collapse into one
//! rid-0 response per flush.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dslink_protocol::{Envelope, Frame, Method, Request, Response, Serializer, Value};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::types::{LinkError, Result};

/// Where the responder and requester put outgoing traffic.
pub trait Outbound: Send + Sync {
    /// Merge into the pending envelope and schedule a flush.
    fn enqueue(&self, envelope: Envelope);

    /// Buffer one `[sid, value, ts]` subscription update.
    fn add_value_update(&self, update: Value);

    /// Drop queued, not yet sent requests using any of `methods`.
    fn discard_queued(&self, methods: &[Method]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Open,
    Message(Envelope),
    /// Always the last event of a connection.
    Close,
}

#[derive(Default)]
struct Queue {
    pending: Envelope,
    updates: Vec<Value>,
}

struct Socket {
    generation: u64,
    tx: mpsc::UnboundedSender<Message>,
    serializer: Arc<dyn Serializer>,
    cancel: CancellationToken,
}

pub struct Connection {
    me: Weak<Connection>,
    state: Mutex<ConnectionState>,
    socket: Mutex<Option<Socket>>,
    generation: AtomicU64,
    queue: Mutex<Queue>,
    flush_lock: Mutex<()>,
    flush_scheduled: AtomicBool,
    always_queue: AtomicBool,
    next_msg: AtomicI64,
    flush_delay: Duration,
}

impl Connection {
    pub fn new(flush_delay: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(ConnectionState::Disconnected),
            socket: Mutex::new(None),
            generation: AtomicU64::new(0),
            queue: Mutex::new(Queue::default()),
            flush_lock: Mutex::new(()),
            flush_scheduled: AtomicBool::new(false),
            always_queue: AtomicBool::new(true),
            next_msg: AtomicI64::new(1),
            flush_delay,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// When off, queue-allowed writes on a live socket bypass the queue.
    pub fn set_always_queue(&self, on: bool) {
        self.always_queue.store(on, Ordering::SeqCst);
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Open the socket.  Events for this connection arrive on the returned
    /// channel: `Open` first, `Close` last.
    pub async fn connect(
        &self,
        url: &str,
        serializer: Arc<dyn Serializer>,
        timeout: Duration,
    ) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>> {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(LinkError::WebSocket(format!("cannot connect while {:?}", *state)));
            }
            *state = ConnectionState::Connecting;
        }

        tracing::debug!(url = %url, format = %serializer.format(), "opening websocket");
        let ws = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(LinkError::WebSocket(e.to_string()));
            }
            Err(_) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(LinkError::WebSocket(format!("connect timed out after {timeout:?}")));
            }
        };
        let (mut sink, mut stream) = ws.split();

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let generation = self.install(frame_tx, serializer.clone(), cancel.clone());

        // Writer task: drains frames to the socket.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = frame_rx.recv() => match next {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                tracing::warn!(error = %e, "websocket write failed");
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = sink.close().await;
        });

        let _ = event_tx.send(ConnectionEvent::Open);

        // Reader task: decodes frames into events.
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                let frame = match next {
                    Some(Ok(Message::Text(text))) => Frame::Text(text),
                    Some(Ok(Message::Binary(bytes))) => Frame::Binary(bytes),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("broker closed connection");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "websocket read failed");
                        break;
                    }
                };
                match serializer.deserialize(&frame) {
                    Ok(envelope) => {
                        if event_tx.send(ConnectionEvent::Message(envelope)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, bytes = frame.len(), "dropping undecodable frame");
                    }
                }
            }
            cancel.cancel();
            if let Some(conn) = me.upgrade() {
                conn.closed(generation);
            }
            let _ = event_tx.send(ConnectionEvent::Close);
        });

        self.flush();
        Ok(event_rx)
    }

    fn install(
        &self,
        tx: mpsc::UnboundedSender<Message>,
        serializer: Arc<dyn Serializer>,
        cancel: CancellationToken,
    ) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.socket.lock() = Some(Socket {
            generation,
            tx,
            serializer,
            cancel,
        });
        *self.state.lock() = ConnectionState::Connected;
        generation
    }

    fn closed(&self, generation: u64) {
        let mut socket = self.socket.lock();
        if socket.as_ref().map(|s| s.generation) == Some(generation) {
            *socket = None;
            *self.state.lock() = ConnectionState::Disconnected;
        }
    }

    /// Close the socket.  The connection's `Close` event follows.
    pub fn disconnect(&self) {
        let socket = self.socket.lock();
        match socket.as_ref() {
            Some(s) => {
                *self.state.lock() = ConnectionState::Disconnecting;
                s.cancel.cancel();
            }
            None => *self.state.lock() = ConnectionState::Disconnected,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Writing
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Queue or send `envelope`.
    ///
    /// With `allow_queue` it is merged into the pending envelope whenever
    /// the socket is down or queueing is always on.  Otherwise it goes out
    /// now, or is dropped if there is no socket.
    pub fn write(&self, envelope: Envelope, allow_queue: bool) {
        if allow_queue && (!self.is_connected() || self.always_queue.load(Ordering::SeqCst)) {
            self.queue.lock().pending.merge(envelope);
            self.schedule_flush();
            return;
        }
        if let Err(e) = self.send_now(envelope) {
            tracing::debug!(error = %e, "unqueued write dropped");
        }
    }

    /// Send everything pending, value updates last as one rid-0 response.
    pub fn flush(&self) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let _flushing = self.flush_lock.lock();
        if !self.is_connected() {
            return;
        }
        let envelope = {
            let mut queue = self.queue.lock();
            let mut envelope = std::mem::take(&mut queue.pending);
            let updates = std::mem::take(&mut queue.updates);
            if !updates.is_empty() {
                envelope
                    .responses
                    .push(Response::subscription_updates(updates).to_value());
            }
            envelope
        };
        if envelope.is_empty() {
            return;
        }
        if let Err(e) = self.send_now(envelope) {
            tracing::warn!(error = %e, "flush failed");
        }
    }

    /// Number of queued requests + responses + value updates.
    pub fn pending_len(&self) -> usize {
        let queue = self.queue.lock();
        queue.pending.requests.len() + queue.pending.responses.len() + queue.updates.len()
    }

    fn schedule_flush(&self) {
        // A connection that is not up yet flushes on open.
        if !self.is_connected() || self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let me = self.me.clone();
                let delay = self.flush_delay;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(conn) = me.upgrade() {
                        conn.flush();
                    }
                });
            }
            Err(_) => self.flush(),
        }
    }

    fn send_now(&self, mut envelope: Envelope) -> Result<()> {
        let (tx, serializer) = {
            let socket = self.socket.lock();
            let socket = socket.as_ref().ok_or(LinkError::NotConnected)?;
            (socket.tx.clone(), socket.serializer.clone())
        };
        if envelope.msg.is_none() {
            envelope.msg = Some(self.next_msg.fetch_add(1, Ordering::SeqCst));
        }

        let frame = match serializer.serialize(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, msg = ?envelope.msg, "failed to encode envelope");
                self.disconnect();
                return Err(e.into());
            }
        };
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        if tx.send(message).is_err() {
            self.disconnect();
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    /// Fake a live socket whose frames land on the returned channel.
    #[cfg(test)]
    pub(crate) fn attach(&self, serializer: Arc<dyn Serializer>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.install(tx, serializer, CancellationToken::new());
        rx
    }
}

impl Outbound for Connection {
    fn enqueue(&self, envelope: Envelope) {
        self.write(envelope, true);
    }

    fn add_value_update(&self, update: Value) {
        self.queue.lock().updates.push(update);
        self.schedule_flush();
    }

    fn discard_queued(&self, methods: &[Method]) {
        self.queue
            .lock()
            .pending
            .requests
            .retain(|raw| !uses_method(raw, methods));
    }
}

fn uses_method(raw: &Value, methods: &[Method]) -> bool {
    Request::parse(raw).is_ok_and(|request| methods.contains(&request.method))
}


#[cfg(test)]
mod tests {
    use dslink_protocol::{Format, Request};

    use super::*;

    fn decode(message: Message) -> Envelope {
        match message {
            Message::Text(text) => Format::Json
                .serializer()
                .deserialize(&Frame::Text(text))
                .unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_writes_merge_and_flush_on_attach() {
        let conn = Connection::new(Duration::from_millis(5));
        conn.enqueue(Envelope::with_requests(vec![Request::list(1, "/").to_value()]));
        conn.enqueue(Envelope::with_requests(vec![Request::list(2, "/a").to_value()]));
        conn.add_value_update(Value::Array(vec![7.into(), 1.into()]));
        conn.add_value_update(Value::Array(vec![7.into(), 2.into()]));
        assert_eq!(conn.pending_len(), 4);

        let mut frames = conn.attach(Format::Json.serializer());
        conn.flush();
        let envelope = decode(frames.recv().await.unwrap());
        assert_eq!(envelope.requests.len(), 2);
        assert_eq!(envelope.responses.len(), 1);
        let updates = Response::parse(&envelope.responses[0]).unwrap();
        assert_eq!(updates.rid, 0);
        assert_eq!(updates.updates.map(|u| u.len()), Some(2));
        assert!(envelope.msg.is_some());
        assert_eq!(conn.pending_len(), 0);
    }

    #[test]
    fn discard_queued_keeps_other_requests() {
        let conn = Connection::new(Duration::from_millis(5));
        conn.enqueue(Envelope::with_requests(vec![
            Request::list(1, "/").to_value(),
            Request::unsubscribe(2, vec![4]).to_value(),
        ]));
        conn.enqueue(Envelope::with_responses(vec![Response::closed(9).to_value()]));
        conn.discard_queued(&[Method::Subscribe, Method::Unsubscribe]);
        assert_eq!(conn.pending_len(), 2);
    }

    #[tokio::test]
    async fn scheduled_flush_runs_after_delay() {
        let conn = Connection::new(Duration::from_millis(5));
        let mut frames = conn.attach(Format::Json.serializer());
        conn.enqueue(Envelope::with_responses(vec![Response::closed(3).to_value()]));
        conn.enqueue(Envelope::with_responses(vec![Response::closed(4).to_value()]));

        let envelope = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .map(decode)
            .unwrap();
        assert_eq!(envelope.responses.len(), 2);
    }

    #[tokio::test]
    async fn unqueued_write_bypasses_queue() {
        let conn = Connection::new(Duration::from_secs(60));
        let mut frames = conn.attach(Format::Json.serializer());
        conn.enqueue(Envelope::with_responses(vec![Response::closed(3).to_value()]));
        conn.write(Envelope::default(), false);

        let heartbeat = decode(frames.recv().await.unwrap());
        assert!(heartbeat.responses.is_empty() && heartbeat.requests.is_empty());
        assert_eq!(conn.pending_len(), 1);
    }

    #[tokio::test]
    async fn msg_ids_increase() {
        let conn = Connection::new(Duration::from_secs(60));
        let mut frames = conn.attach(Format::Json.serializer());
        conn.write(Envelope::default(), false);
        conn.write(Envelope::default(), false);
        let a = decode(frames.recv().await.unwrap()).msg.unwrap();
        let b = decode(frames.recv().await.unwrap()).msg.unwrap();
        assert!(b > a);
    }

    #[test]
    fn unqueued_write_without_socket_is_dropped() {
        let conn = Connection::new(Duration::from_millis(5));
        conn.write(Envelope::default(), false);
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn dead_socket_disconnects() {
        let conn = Connection::new(Duration::from_secs(60));
        let frames = conn.attach(Format::Json.serializer());
        drop(frames);
        conn.write(Envelope::default(), false);
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
    }

    #[tokio::test]
    async fn ack_survives_merge() {
        let conn = Connection::new(Duration::from_millis(5));
        conn.enqueue(Envelope {
            ack: Some(3),
            ..Default::default()
        });
        conn.enqueue(Envelope {
            ack: Some(4),
            ..Default::default()
        });
        let mut frames = conn.attach(Format::MsgPack.serializer());
        conn.flush();
        let envelope = match frames.recv().await.unwrap() {
            Message::Binary(bytes) => Format::MsgPack
                .serializer()
                .deserialize(&Frame::Binary(bytes))
                .unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(envelope.ack, Some(4));
    }
}
