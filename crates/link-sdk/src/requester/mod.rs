//! Requester: issues requests to other links through the broker and routes
//! their responses back.
//!
//! Every call allocates a fresh rid and returns a handle.  Responses are
//! matched by rid; rid 0 carries subscription values, fanned out to every
//! local subscriber of the wire sid.

mod remote_node;
mod subscriptions;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dslink_protocol::{
    Column, Envelope, Method, Permission, Request, Response, StreamState, SubscriptionUpdate,
    Value,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

pub use remote_node::RemoteNode;
pub use subscriptions::SubscriptionCallback;

use crate::connection::Outbound;
use crate::types::{LinkError, Result};
use subscriptions::SubscriptionTable;

enum PendingRequest {
    List {
        node: RemoteNode,
        tx: mpsc::UnboundedSender<RemoteNode>,
    },
    Set(oneshot::Sender<Response>),
    Remove(oneshot::Sender<Response>),
    Invoke {
        columns: Vec<Column>,
        tx: mpsc::UnboundedSender<InvokeUpdate>,
    },
}

// ── Handles ─────────────────────────────────────────────────────────

/// Successive states of a listed node.  Ends when the stream is closed.
pub struct ListStream {
    rid: i64,
    rx: mpsc::UnboundedReceiver<RemoteNode>,
}

impl ListStream {
    pub fn rid(&self) -> i64 {
        self.rid
    }

    pub async fn next(&mut self) -> Option<RemoteNode> {
        self.rx.recv().await
    }
}

/// Resolves with the single response to a `set` or `remove`.
pub struct ResponseHandle {
    rid: i64,
    rx: oneshot::Receiver<Response>,
}

impl ResponseHandle {
    pub fn rid(&self) -> i64 {
        self.rid
    }

    /// Fails with [`LinkError::RequestClosed`] if the connection dropped
    /// first.
    pub async fn response(self) -> Result<Response> {
        self.rx.await.map_err(|_| LinkError::RequestClosed(self.rid))
    }
}

/// One response on an invoke stream.  `columns` is the latest column set
/// seen on the stream.
#[derive(Debug, Clone)]
pub struct InvokeUpdate {
    pub columns: Vec<Column>,
    pub rows: Vec<Value>,
    pub stream: Option<StreamState>,
    pub meta: Option<Value>,
    pub error: Option<Value>,
}

impl InvokeUpdate {
    pub fn is_closed(&self) -> bool {
        self.stream == Some(StreamState::Closed)
    }
}

pub struct InvokeStream {
    rid: i64,
    rx: mpsc::UnboundedReceiver<InvokeUpdate>,
}

impl InvokeStream {
    pub fn rid(&self) -> i64 {
        self.rid
    }

    pub async fn next(&mut self) -> Option<InvokeUpdate> {
        self.rx.recv().await
    }

    /// Drain to the end of the stream and return every row.
    pub async fn collect_rows(mut self) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        while let Some(update) = self.next().await {
            let closed = update.is_closed();
            let InvokeUpdate {
                rows: batch, error, ..
            } = update;
            rows.extend(batch);
            if let Some(error) = error {
                return Err(LinkError::Other(anyhow::anyhow!("invoke {} failed: {error}", self.rid)));
            }
            if closed {
                return Ok(rows);
            }
        }
        Err(LinkError::RequestClosed(self.rid))
    }
}

// ── Requester ───────────────────────────────────────────────────────

struct RequesterInner {
    outbound: Arc<dyn Outbound>,
    next_rid: AtomicI64,
    next_sid: AtomicI64,
    next_virtual_sid: AtomicI64,
    pending: Mutex<HashMap<i64, PendingRequest>>,
    subscriptions: Mutex<SubscriptionTable>,
}

#[derive(Clone)]
pub struct Requester {
    inner: Arc<RequesterInner>,
}

impl Requester {
    pub(crate) fn new(outbound: Arc<dyn Outbound>) -> Self {
        Self {
            inner: Arc::new(RequesterInner {
                outbound,
                next_rid: AtomicI64::new(1),
                next_sid: AtomicI64::new(1),
                next_virtual_sid: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(SubscriptionTable::default()),
            }),
        }
    }

    fn next_rid(&self) -> i64 {
        self.inner.next_rid.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, request: Request) {
        tracing::debug!(rid = request.rid, method = %request.method, path = ?request.path, "sending request");
        self.inner
            .outbound
            .enqueue(Envelope::with_requests(vec![request.to_value()]));
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Wire subscriptions currently held.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Requests
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn list(&self, path: &str) -> ListStream {
        let rid = self.next_rid();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(
            rid,
            PendingRequest::List {
                node: RemoteNode::new(path),
                tx,
            },
        );
        self.send(Request::list(rid, path));
        ListStream { rid, rx }
    }

    pub fn set(&self, path: &str, value: impl Into<Value>, permit: Option<Permission>) -> ResponseHandle {
        let rid = self.next_rid();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(rid, PendingRequest::Set(tx));
        self.send(Request::set(rid, path, value.into(), permit));
        ResponseHandle { rid, rx }
    }

    pub fn remove(&self, path: &str) -> ResponseHandle {
        let rid = self.next_rid();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(rid, PendingRequest::Remove(tx));
        self.send(Request::remove(rid, path));
        ResponseHandle { rid, rx }
    }

    pub fn invoke(&self, path: &str, params: Value, permit: Option<Permission>) -> InvokeStream {
        let rid = self.next_rid();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(
            rid,
            PendingRequest::Invoke {
                columns: Vec::new(),
                tx,
            },
        );
        self.send(Request::invoke(rid, path, params, permit));
        InvokeStream { rid, rx }
    }

    /// Watch `path`'s value.  Returns a local subscription id for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, path: &str, callback: impl Fn(&SubscriptionUpdate) + Send + Sync + 'static) -> i64 {
        self.subscribe_with_qos(path, None, callback)
    }

    pub fn subscribe_with_qos(
        &self,
        path: &str,
        qos: Option<i64>,
        callback: impl Fn(&SubscriptionUpdate) + Send + Sync + 'static,
    ) -> i64 {
        let virtual_sid = self.inner.next_virtual_sid.fetch_add(1, Ordering::SeqCst);
        let wire = self.inner.subscriptions.lock().add(
            path,
            qos,
            virtual_sid,
            Arc::new(callback),
            || self.inner.next_sid.fetch_add(1, Ordering::SeqCst),
        );
        if let Some(entry) = wire {
            let rid = self.next_rid();
            self.send(Request::subscribe(rid, vec![entry]));
        }
        virtual_sid
    }

    pub fn unsubscribe(&self, virtual_sid: i64) -> Result<()> {
        let last = self
            .inner
            .subscriptions
            .lock()
            .remove(virtual_sid)
            .map_err(|_| LinkError::UnknownSubscription(virtual_sid))?;
        if let Some(sid) = last {
            let rid = self.next_rid();
            self.send(Request::unsubscribe(rid, vec![sid]));
        }
        Ok(())
    }

    /// Cancel a list or invoke stream.  Returns `false` for unknown rids.
    pub fn close(&self, rid: i64) -> bool {
        if self.inner.pending.lock().remove(&rid).is_none() {
            return false;
        }
        self.send(Request::close(rid));
        true
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Responses
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Route one inbound `responses` array.
    pub fn process_responses(&self, responses: Vec<Value>) {
        for raw in &responses {
            let response = match Response::parse(raw) {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed response");
                    continue;
                }
            };
            if response.rid == 0 {
                self.dispatch_updates(&response);
            } else {
                self.resolve(response);
            }
        }
    }

    fn dispatch_updates(&self, response: &Response) {
        for raw in response.updates.iter().flatten() {
            let Some(update) = SubscriptionUpdate::parse(raw) else {
                tracing::debug!("skipping malformed subscription update");
                continue;
            };
            let callbacks = self.inner.subscriptions.lock().callbacks(update.sid);
            match callbacks {
                Some(callbacks) => {
                    for callback in callbacks {
                        callback(&update);
                    }
                }
                None => tracing::debug!(sid = update.sid, "update for unknown subscription"),
            }
        }
    }

    fn resolve(&self, response: Response) {
        let rid = response.rid;
        let closed = response.is_closed();
        let mut pending = self.inner.pending.lock();
        let Some(entry) = pending.get_mut(&rid) else {
            tracing::debug!(rid, "response for unknown request");
            return;
        };

        let mut finished = closed;
        let mut abandoned = false;
        match entry {
            PendingRequest::List { node, tx } => {
                if let Some(updates) = &response.updates {
                    node.apply_updates(updates);
                }
                abandoned = tx.send(node.clone()).is_err();
            }
            PendingRequest::Set(_) | PendingRequest::Remove(_) => finished = true,
            PendingRequest::Invoke { columns, tx } => {
                if let Some(new_columns) = &response.columns {
                    *columns = new_columns.clone();
                }
                let update = InvokeUpdate {
                    columns: columns.clone(),
                    rows: response.updates.clone().unwrap_or_default(),
                    stream: response.stream,
                    meta: response.meta.clone(),
                    error: response.error.clone(),
                };
                abandoned = tx.send(update).is_err();
            }
        }

        if finished || abandoned {
            if let Some(PendingRequest::Set(tx) | PendingRequest::Remove(tx)) = pending.remove(&rid) {
                let _ = tx.send(response);
            }
        }
        drop(pending);

        // Nobody is listening any more; stop the remote side too.
        if abandoned && !finished {
            tracing::debug!(rid, "stream handle dropped, closing");
            self.send(Request::close(rid));
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Connection lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Queue every live subscription for the next socket.  Called while
    /// disconnected; queued subscribe and unsubscribe requests are replaced
    /// by the full set.
    pub(crate) fn resubscribe(&self) {
        self.inner
            .outbound
            .discard_queued(&[Method::Subscribe, Method::Unsubscribe]);
        let paths = self.inner.subscriptions.lock().wire_paths();
        if paths.is_empty() {
            return;
        }
        tracing::info!(count = paths.len(), "resubscribing");
        let rid = self.next_rid();
        self.send(Request::subscribe(rid, paths));
    }

    /// Fail every in-flight request; their handles see the channel close.
    pub(crate) fn clear_pending(&self) {
        let drained: Vec<i64> = {
            let mut pending = self.inner.pending.lock();
            let rids = pending.keys().copied().collect();
            pending.clear();
            rids
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "dropping pending requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::connection::testing::RecordingOutbound;
    use crate::node::NodeView;

    fn requester() -> (Requester, Arc<RecordingOutbound>) {
        let outbound = Arc::new(RecordingOutbound::default());
        (Requester::new(outbound.clone()), outbound)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&SubscriptionUpdate) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_: &SubscriptionUpdate| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn rids_increase() {
        let (requester, outbound) = requester();
        requester.list("/a");
        requester.remove("/b");
        let rids: Vec<i64> = outbound.requests().iter().map(|r| r.rid).collect();
        assert_eq!(rids, vec![1, 2]);
    }

    #[test]
    fn duplicate_subscriptions_share_one_wire_request() {
        let (requester, outbound) = requester();
        let (hits1, cb1) = counter();
        let (hits2, cb2) = counter();
        let v1 = requester.subscribe("/a", cb1);
        let v2 = requester.subscribe("/a", cb2);
        assert_ne!(v1, v2);

        let subscribes: Vec<Request> = outbound
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::Subscribe)
            .collect();
        assert_eq!(subscribes.len(), 1);
        let sid = subscribes[0].paths[0].sid;

        let update = Response::subscription_updates(vec![Value::Array(vec![
            Value::Int(sid),
            Value::Int(5),
            "2024-01-01T00:00:00.000+00:00".into(),
        ])]);
        requester.process_responses(vec![update.to_value()]);
        assert_eq!(hits1.load(Ordering::SeqCst), 1);
        assert_eq!(hits2.load(Ordering::SeqCst), 1);

        requester.unsubscribe(v1).unwrap();
        assert!(outbound.requests().iter().all(|r| r.method != Method::Unsubscribe));
        requester.process_responses(vec![update.to_value()]);
        assert_eq!(hits1.load(Ordering::SeqCst), 1);
        assert_eq!(hits2.load(Ordering::SeqCst), 2);

        requester.unsubscribe(v2).unwrap();
        let unsubscribes: Vec<Request> = outbound
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::Unsubscribe)
            .collect();
        assert_eq!(unsubscribes.len(), 1);
        assert_eq!(unsubscribes[0].sids, vec![sid]);

        assert!(matches!(
            requester.unsubscribe(v2),
            Err(LinkError::UnknownSubscription(_))
        ));
    }

    #[test]
    fn aggregate_updates_decode() {
        let (requester, _outbound) = requester();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        requester.subscribe("/agg", move |u| s.lock().push(u.clone()));

        let raw: Value = serde_json::from_str(
            r#"{"rid":0,"updates":[{"sid":1,"value":4.5,"ts":"2024-01-01T00:00:00.000+00:00","count":3,"sum":13.5,"min":4,"max":5}]}"#,
        )
        .unwrap();
        requester.process_responses(vec![raw]);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].count, Some(3));
        assert_eq!(seen[0].max, Some(5.0));
    }

    #[test]
    fn unknown_sid_and_rid_are_ignored() {
        let (requester, _outbound) = requester();
        let update = Response::subscription_updates(vec![Value::Array(vec![99.into(), 1.into()])]);
        requester.process_responses(vec![update.to_value(), Response::closed(1234).to_value()]);
    }

    #[tokio::test]
    async fn set_resolves_and_leaves_pending() {
        let (requester, _outbound) = requester();
        let handle = requester.set("/x", 3, None);
        assert_eq!(requester.pending_count(), 1);
        requester.process_responses(vec![Response::closed(handle.rid()).to_value()]);
        assert_eq!(requester.pending_count(), 0);
        assert!(handle.response().await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn pending_fails_on_disconnect() {
        let (requester, _outbound) = requester();
        let handle = requester.remove("/x/@a");
        let mut list = requester.list("/");
        requester.clear_pending();
        assert!(matches!(handle.response().await, Err(LinkError::RequestClosed(_))));
        assert!(list.next().await.is_none());
    }

    #[tokio::test]
    async fn list_builds_remote_node() {
        let (requester, _outbound) = requester();
        let mut list = requester.list("/data");
        let updates = vec![
            Value::Array(vec!["$is".into(), "node".into()]),
            Value::Array(vec!["child".into(), Value::map()]),
        ];
        requester.process_responses(vec![Response::open(list.rid(), updates).to_value()]);
        let node = list.next().await.unwrap();
        assert_eq!(node.path(), "/data");
        assert_eq!(node.child_names(), vec!["child"]);
        assert_eq!(requester.pending_count(), 1);

        let removal: Value = serde_json::from_str(r#"{"name":"child","change":"remove"}"#).unwrap();
        requester.process_responses(vec![Response::open(list.rid(), vec![removal]).to_value()]);
        assert!(list.next().await.unwrap().child_names().is_empty());
    }

    #[tokio::test]
    async fn invoke_stays_pending_until_closed() {
        let (requester, _outbound) = requester();
        let mut stream = requester.invoke("/act", Value::map(), None);
        let rid = stream.rid();

        let mut first = Response::open(rid, vec![Value::Array(vec![1.into()])]);
        first.columns = Some(vec![Column::new("n", "number")]);
        requester.process_responses(vec![first.to_value()]);
        assert_eq!(requester.pending_count(), 1);

        requester.process_responses(vec![Response::open(rid, vec![Value::Array(vec![2.into()])]).to_value()]);
        let mut last = Response::closed(rid);
        last.updates = Some(vec![Value::Array(vec![3.into()])]);
        requester.process_responses(vec![last.to_value()]);
        assert_eq!(requester.pending_count(), 0);

        let a = stream.next().await.unwrap();
        assert_eq!(a.columns.len(), 1);
        let b = stream.next().await.unwrap();
        assert_eq!(b.columns.len(), 1, "columns carried forward");
        let rows = stream.collect_rows().await.unwrap();
        assert_eq!(rows, vec![Value::Array(vec![3.into()])]);
    }

    #[tokio::test]
    async fn collect_rows_gathers_every_batch_until_closed() {
        let (requester, _outbound) = requester();
        let stream = requester.invoke("/act", Value::map(), None);
        let rid = stream.rid();
        requester.process_responses(vec![Response::open(rid, vec![Value::Array(vec![1.into()])]).to_value()]);
        let mut last = Response::closed(rid);
        last.updates = Some(vec![Value::Array(vec![2.into()])]);
        requester.process_responses(vec![last.to_value()]);

        let rows = stream.collect_rows().await.unwrap();
        assert_eq!(rows, vec![Value::Array(vec![1.into()]), Value::Array(vec![2.into()])]);
    }

    #[tokio::test]
    async fn collect_rows_surfaces_stream_error() {
        let (requester, _outbound) = requester();
        let stream = requester.invoke("/act", Value::map(), None);
        let mut failed = Response::closed(stream.rid());
        failed.error = Some(Value::from("boom"));
        requester.process_responses(vec![failed.to_value()]);

        assert!(matches!(stream.collect_rows().await, Err(LinkError::Other(_))));
    }

    #[test]
    fn close_sends_close_and_forgets() {
        let (requester, outbound) = requester();
        let stream = requester.invoke("/act", Value::map(), None);
        assert!(requester.close(stream.rid()));
        assert!(!requester.close(stream.rid()));
        assert_eq!(requester.pending_count(), 0);
        assert!(outbound.requests().iter().any(|r| r.method == Method::Close && r.rid == stream.rid()));
    }

    #[test]
    fn dropped_list_handle_closes_remote_stream() {
        let (requester, outbound) = requester();
        let list = requester.list("/");
        let rid = list.rid();
        drop(list);
        requester.process_responses(vec![Response::open(rid, vec![]).to_value()]);
        assert_eq!(requester.pending_count(), 0);
        assert!(outbound.requests().iter().any(|r| r.method == Method::Close && r.rid == rid));
    }

    #[test]
    fn resubscribe_covers_every_path() {
        let (requester, outbound) = requester();
        requester.subscribe("/a", |_| {});
        requester.subscribe("/a", |_| {});
        requester.subscribe("/b", |_| {});
        outbound.clear();

        requester.resubscribe();
        let requests = outbound.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Subscribe);
        assert_eq!(requests[0].paths.len(), 2);
    }

    #[test]
    fn resubscribe_replaces_queued_subscribes() {
        let (requester, outbound) = requester();
        requester.subscribe("/a", |_| {});
        let gone = requester.subscribe("/b", |_| {});
        requester.unsubscribe(gone).unwrap();

        requester.resubscribe();
        let requests = outbound.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Subscribe);
        assert_eq!(requests[0].paths.len(), 1);
        assert_eq!(requests[0].paths[0].path, "/a");
    }
}
