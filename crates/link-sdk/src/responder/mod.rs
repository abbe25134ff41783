//! Responder: serves this link's node tree to the broker.
//!
//! [`Responder::process_requests`] turns the `requests` array of an inbound
//! envelope into tree reads/writes and queued responses.  Subscriptions
//! and open streams are tracked here and on the nodes themselves, and are
//! forgotten wholesale when the connection drops.

mod streams;
mod subscriptions;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dslink_protocol::{Envelope, Method, Permission, ProtocolError, Request, Response, Value};
use futures_util::FutureExt;
use parking_lot::RwLock;

use crate::connection::Outbound;
use crate::node::{InvokeRequest, Node, NodeView, CLASS_KEY};
use crate::platform::Storage;
use crate::types::{protocol_error, ActionError, Result};

use streams::StreamManager;
use subscriptions::SubscriptionManager;

type NodeClass = Arc<dyn Fn(&Node) + Send + Sync>;

/// State shared between the responder and the nodes of its tree.
pub(crate) struct ResponderCore {
    outbound: Arc<dyn Outbound>,
    subscriptions: SubscriptionManager,
    streams: StreamManager,
    node_classes: RwLock<HashMap<String, NodeClass>>,
}

impl ResponderCore {
    pub(crate) fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.outbound
    }

    /// A subtree left the tree; its registrations go with it.
    pub(crate) fn forget(&self, sids: &[i64], rids: &[i64]) {
        self.subscriptions.forget(sids);
        self.streams.forget(rids);
    }

    /// A node just joined the tree.
    pub(crate) fn on_node_built(&self, node: &Node) {
        self.apply_class(node);

        let rids = self.streams.take_pending(node.path());
        if rids.is_empty() {
            return;
        }
        let updates = node.list_updates();
        let responses = rids
            .into_iter()
            .map(|rid| {
                self.streams.open_list(rid, node);
                Response::open(rid, updates.clone()).to_value()
            })
            .collect();
        self.outbound.enqueue(Envelope::with_responses(responses));
    }

    fn apply_class(&self, node: &Node) {
        let Some(class) = node.private_configs().get(CLASS_KEY) else {
            return;
        };
        let Some(name) = class.as_str() else { return };
        let init = self.node_classes.read().get(name).cloned();
        match init {
            Some(init) => init(node),
            None => tracing::debug!(path = %node.path(), class = %name, "no initializer for node class"),
        }
    }
}

#[derive(Clone)]
pub struct Responder {
    core: Arc<ResponderCore>,
    root: Node,
}

impl Responder {
    pub(crate) fn new(outbound: Arc<dyn Outbound>) -> Self {
        let core = Arc::new(ResponderCore {
            outbound,
            subscriptions: SubscriptionManager::default(),
            streams: StreamManager::default(),
            node_classes: RwLock::new(HashMap::new()),
        });
        let root = Node::root(Arc::downgrade(&core));
        Self { core, root }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<Node> {
        self.root.get(path)
    }

    /// Register `init` for nodes whose `class` private config is `name`.
    /// Runs now for matching nodes already in the tree, and later for each
    /// matching node as it is built or loaded.
    pub fn add_node_class(&self, name: &str, init: impl Fn(&Node) + Send + Sync + 'static) {
        let init: NodeClass = Arc::new(init);
        self.core
            .node_classes
            .write()
            .insert(name.to_string(), init.clone());

        let mut stack = self.root.children();
        while let Some(node) = stack.pop() {
            if node.private_configs().get(CLASS_KEY).as_ref().and_then(Value::as_str) == Some(name) {
                init(&node);
            }
            stack.extend(node.children());
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.core.subscriptions.len()
    }

    pub fn open_stream_count(&self) -> usize {
        self.core.streams.len()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Request dispatch
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Handle one inbound `requests` array.
    ///
    /// Malformed entries are skipped.  An unknown method aborts the rest of
    /// the batch and is returned as an error; responses for the entries
    /// before it are still sent.
    pub fn process_requests(&self, requests: Vec<Value>) -> std::result::Result<(), ProtocolError> {
        let mut responses = Vec::new();
        let mut outcome = Ok(());

        for raw in &requests {
            let request = match Request::parse(raw) {
                Ok(request) => request,
                Err(e @ ProtocolError::UnknownMethod(_)) => {
                    tracing::error!(error = %e, "unknown request method, dropping rest of batch");
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed request");
                    continue;
                }
            };
            tracing::debug!(rid = request.rid, method = %request.method, path = ?request.path, "request");
            if let Some(response) = self.handle(request) {
                responses.push(response.to_value());
            }
        }

        if !responses.is_empty() {
            self.core.outbound.enqueue(Envelope::with_responses(responses));
        }
        outcome
    }

    fn handle(&self, request: Request) -> Option<Response> {
        match request.method {
            Method::List => self.list(&request),
            Method::Set => self.set(&request),
            Method::Remove => self.remove(&request),
            Method::Invoke => self.invoke(request),
            Method::Subscribe => Some(self.subscribe(&request)),
            Method::Unsubscribe => Some(self.unsubscribe(&request)),
            Method::Close => {
                if !self.core.streams.close(request.rid) {
                    tracing::debug!(rid = request.rid, "close for unknown stream");
                }
                None
            }
        }
    }

    fn list(&self, request: &Request) -> Option<Response> {
        let path = required_path(request)?;
        match self.root.get(path) {
            Some(node) => {
                self.core.streams.open_list(request.rid, &node);
                Some(Response::open(request.rid, node.list_updates()))
            }
            None => {
                tracing::debug!(rid = request.rid, path = %path, "list on missing node deferred");
                self.core.streams.defer_list(path, request.rid);
                None
            }
        }
    }

    fn set(&self, request: &Request) -> Option<Response> {
        let path = required_path(request)?;
        let Some(value) = request.value.clone() else {
            tracing::warn!(rid = request.rid, path = %path, "set without value");
            return None;
        };

        if let Some((node_path, key)) = split_metadata(path) {
            if !matches!(request.permit, None | Some(Permission::Config)) {
                return Some(denied(request.rid));
            }
            return Some(match self.root.get(node_path) {
                Some(node) => {
                    metadata_map(&node, key).set(key, value);
                    Response::closed(request.rid)
                }
                None => invalid_path(request.rid, path),
            });
        }

        let Some(node) = self.root.get(path) else {
            return Some(invalid_path(request.rid, path));
        };
        let writable = node.config("writable").as_ref().and_then(Permission::from_value);
        if !permit_allows(request.permit, writable) {
            return Some(denied(request.rid));
        }
        node.remote_set(value);
        Some(Response::closed(request.rid))
    }

    fn remove(&self, request: &Request) -> Option<Response> {
        let path = required_path(request)?;
        if !matches!(request.permit, None | Some(Permission::Config)) {
            return Some(denied(request.rid));
        }

        if let Some((node_path, key)) = split_metadata(path) {
            return Some(match self.root.get(node_path) {
                Some(node) => {
                    metadata_map(&node, key).remove(key);
                    Response::closed(request.rid)
                }
                None => invalid_path(request.rid, path),
            });
        }

        let removed = self
            .root
            .get(path)
            .filter(|node| !node.is_root())
            .and_then(|node| node.parent().and_then(|parent| parent.remove_child(node.name())));
        Some(match removed {
            Some(_) => Response::closed(request.rid),
            None => invalid_path(request.rid, path),
        })
    }

    fn invoke(&self, request: Request) -> Option<Response> {
        let rid = request.rid;
        let path = required_path(&request)?.to_string();
        let Some(node) = self.root.get(&path) else {
            return Some(invalid_path(rid, &path));
        };
        let Some(handler) = node.action() else {
            let mut response = Response::closed(rid);
            response.error = Some(protocol_error("notImplemented", &format!("{path} has no action")));
            return Some(response);
        };
        if !permit_allows(request.permit, Some(handler.permission())) {
            return Some(denied(rid));
        }

        let params = request.params.unwrap_or_else(Value::map);
        let invocation = InvokeRequest::new(rid, path.clone(), params, &handler, self.core.outbound.clone());
        self.core.streams.open_invoke(rid, invocation.state.clone());

        let core = self.core.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.action.invoke(invocation.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => invocation.close(),
                Ok(Err(e)) => {
                    tracing::debug!(rid, path = %path, error = %e, "action failed");
                    invocation.close_with_error(&e);
                }
                Err(_panic) => {
                    tracing::error!(rid, path = %path, "action panicked");
                    invocation.close_with_error(&ActionError::Failed("action panicked".into()));
                }
            }
            core.streams.release_invoke(rid, &invocation.state);
        });
        None
    }

    fn subscribe(&self, request: &Request) -> Response {
        for entry in &request.paths {
            match self.root.get(&entry.path) {
                Some(node) => {
                    self.core
                        .subscriptions
                        .subscribe(entry.sid, &node, self.core.outbound.as_ref())
                }
                None => tracing::debug!(sid = entry.sid, path = %entry.path, "subscribe to missing node"),
            }
        }
        Response::closed(request.rid)
    }

    fn unsubscribe(&self, request: &Request) -> Response {
        for sid in &request.sids {
            if !self.core.subscriptions.unsubscribe(*sid) {
                tracing::debug!(sid, "unsubscribe for unknown sid");
            }
        }
        Response::closed(request.rid)
    }

    /// Forget every subscription and stream.  Called when the connection
    /// drops; running invocations stop emitting but keep running.
    pub fn clear_registrations(&self) {
        self.core.subscriptions.clear();
        self.core.streams.clear();
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Persistence
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn serialize_to_disk(&self, storage: &dyn Storage, filename: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.root.serialize())?;
        storage.write(filename, &json).await?;
        tracing::debug!(file = %filename, "nodes saved");
        Ok(())
    }

    /// Load the tree from `filename`.  On any failure the tree is reset and
    /// `false` is returned so the caller can build default nodes instead.
    pub async fn deserialize_from_disk(&self, storage: &dyn Storage, filename: &str) -> bool {
        if !storage.exists(filename).await {
            tracing::info!(file = %filename, "no saved nodes");
            self.root.reset();
            return false;
        }
        let loaded: Result<()> = async {
            let raw = storage.read(filename).await?;
            let snapshot: Value = serde_json::from_str(&raw)?;
            self.root.reset();
            self.root.deserialize(&snapshot)
        }
        .await;

        match loaded {
            Ok(()) => {
                tracing::info!(file = %filename, children = self.root.children().len(), "nodes loaded");
                true
            }
            Err(e) => {
                tracing::warn!(file = %filename, error = %e, "failed to load nodes, starting empty");
                self.root.reset();
                false
            }
        }
    }
}

// ── helpers ─────────────────────────────────────────────────────────

fn required_path(request: &Request) -> Option<&str> {
    let path = request.path.as_deref();
    if path.is_none() {
        tracing::warn!(rid = request.rid, method = %request.method, "request without path");
    }
    path
}

/// `/a/b/$name` → `("/a/b", "$name")`.
fn split_metadata(path: &str) -> Option<(&str, &str)> {
    let (parent, last) = path.rsplit_once('/')?;
    if last.starts_with('$') || last.starts_with('@') {
        Some((if parent.is_empty() { "/" } else { parent }, last))
    } else {
        None
    }
}

fn metadata_map<'a>(node: &'a Node, key: &str) -> &'a crate::node::MetadataMap {
    if key.starts_with('@') {
        node.attributes()
    } else {
        node.configs()
    }
}

/// No permit, or exactly the permission the node requires.
fn permit_allows(permit: Option<Permission>, required: Option<Permission>) -> bool {
    match permit {
        None => true,
        Some(permit) => required == Some(permit),
    }
}

fn denied(rid: i64) -> Response {
    let mut response = Response::closed(rid);
    response.error = Some(protocol_error("permissionDenied", "permission denied"));
    response
}

fn invalid_path(rid: i64, path: &str) -> Response {
    let mut response = Response::closed(rid);
    response.error = Some(protocol_error("invalidPath", &format!("no node at {path}")));
    response
}
