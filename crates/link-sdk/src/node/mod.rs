//! The responder's node tree.
//!
//! A [`Node`] is a cheap handle (`Arc`) to a named point in the tree.  The
//! tree owns its children strongly and refers to parents weakly, so
//! dropping the root drops everything.  Nodes reach the responder through
//! a weak reference as well; a detached node (tests, or a tree whose
//! responder is gone) still works, it just has nobody to notify.
//!
//! Every mutation of the child, subscriber or stream sets goes through the
//! per-node `state` mutex.  Notifications are computed under the lock and
//! sent after it is released.

mod action;
mod builder;
mod metadata;
mod value;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dslink_protocol::{format_timestamp, parse_timestamp, Envelope, Response, Value};
use parking_lot::Mutex;

pub use action::{Action, ActionHandler, InvokeRequest, ResultType};
pub(crate) use action::InvokeState;
pub use builder::NodeBuilder;
pub use metadata::{MetadataChange, MetadataKind, MetadataMap};
pub use value::{NodeValue, ValueChange};

use crate::observer::{ListenerId, Listeners};
use crate::responder::ResponderCore;
use crate::types::{LinkError, Result};

/// Characters a node name may not contain.
pub const BANNED_CHARS: &[char] = &[
    '%', '.', '/', '\\', '?', '*', ':', '|', '<', '>', '$', '@', ',', '\'', '"',
];

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(BANNED_CHARS) {
        return Err(LinkError::InvalidNodeName(name.to_string()));
    }
    Ok(())
}

// Snapshot keys that are not configs, attributes or children.
const VALUE_KEY: &str = "?value";
const VALUE_TIMESTAMP_KEY: &str = "?value_timestamp";
const PRIVATE_CONFIGS_KEY: &str = "?privateConfigs";

/// Private config naming the node class (see `Responder::add_node_class`).
pub const CLASS_KEY: &str = "class";

/// Read-only view shared by local nodes and nodes discovered through the
/// requester.
pub trait NodeView {
    fn name(&self) -> &str;
    fn path(&self) -> &str;
    fn config(&self, key: &str) -> Option<Value>;
    fn attribute(&self, key: &str) -> Option<Value>;
    fn child_names(&self) -> Vec<String>;
    fn current_value(&self) -> Value;

    /// `$is`, defaulting to `"node"`.
    fn profile(&self) -> String {
        self.config("$is")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "node".into())
    }
}

#[derive(Default)]
struct NodeState {
    children: HashMap<String, Node>,
    removed_children: Vec<String>,
    subscribers: HashSet<i64>,
    streams: HashSet<i64>,
    action: Option<ActionHandler>,
}

pub(crate) struct NodeInner {
    name: String,
    path: String,
    parent: Weak<NodeInner>,
    core: Weak<ResponderCore>,
    building: AtomicBool,
    value: NodeValue,
    configs: MetadataMap,
    attributes: MetadataMap,
    private_configs: MetadataMap,
    state: Mutex<NodeState>,
    remote_set: Listeners<Value>,
}

#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("path", &self.0.path).finish()
    }
}

impl Node {
    fn create(
        name: String,
        path: String,
        parent: Weak<NodeInner>,
        core: Weak<ResponderCore>,
        building: bool,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| NodeInner {
            name,
            path,
            parent,
            core,
            building: AtomicBool::new(building),
            value: NodeValue::new(weak.clone()),
            configs: MetadataMap::new(MetadataKind::Config, weak.clone()),
            attributes: MetadataMap::new(MetadataKind::Attribute, weak.clone()),
            private_configs: MetadataMap::new(MetadataKind::Private, weak.clone()),
            state: Mutex::new(NodeState::default()),
            remote_set: Listeners::new(),
        });
        inner.configs.set_quiet("is", "node".into());
        Node(inner)
    }

    /// A root node at `/`.
    pub(crate) fn root(core: Weak<ResponderCore>) -> Self {
        Self::create(String::new(), "/".into(), Weak::new(), core, false)
    }

    /// A root with no responder behind it.
    pub fn detached_root() -> Self {
        Self::root(Weak::new())
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Node(inner)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn path(&self) -> &str {
        &self.0.path
    }

    pub fn parent(&self) -> Option<Node> {
        self.0.parent.upgrade().map(Node)
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.upgrade().is_none() && self.0.name.is_empty()
    }

    pub fn is_building(&self) -> bool {
        self.0.building.load(Ordering::SeqCst)
    }

    pub fn value(&self) -> &NodeValue {
        &self.0.value
    }

    pub fn configs(&self) -> &MetadataMap {
        &self.0.configs
    }

    pub fn attributes(&self) -> &MetadataMap {
        &self.0.attributes
    }

    pub fn private_configs(&self) -> &MetadataMap {
        &self.0.private_configs
    }

    /// Same underlying node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn core(&self) -> Option<Arc<ResponderCore>> {
        self.0.core.upgrade()
    }

    // ── Children ────────────────────────────────────────────────────

    /// Start building a child.  It joins the tree on
    /// [`NodeBuilder::build`].
    pub fn create_child(&self, name: &str) -> Result<NodeBuilder> {
        validate_name(name)?;
        let path = if self.0.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.0.path)
        };
        let child = Self::create(
            name.to_string(),
            path,
            Arc::downgrade(&self.0),
            self.0.core.clone(),
            true,
        );
        Ok(NodeBuilder::new(self.clone(), child))
    }

    pub fn child(&self, name: &str) -> Option<Node> {
        self.0.state.lock().children.get(name).cloned()
    }

    pub fn children(&self) -> Vec<Node> {
        self.0.state.lock().children.values().cloned().collect()
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.0.state.lock().children.contains_key(name)
    }

    /// Called by the builder once the child is staged.
    fn add_child(&self, child: &Node) -> Result<()> {
        {
            let mut state = self.0.state.lock();
            if state.children.contains_key(child.name()) {
                return Err(LinkError::DuplicateChild(child.path().to_string()));
            }
            state.children.insert(child.name().to_string(), child.clone());
            state.removed_children.retain(|n| n != child.name());
        }
        self.update_subscribers();
        Ok(())
    }

    /// Detach a child.  Its subtree's subscriptions and streams are dropped
    /// with it.
    pub fn remove_child(&self, name: &str) -> Option<Node> {
        let removed = {
            let mut state = self.0.state.lock();
            let removed = state.children.remove(name);
            if removed.is_some() {
                state.removed_children.push(name.to_string());
            }
            removed
        };
        let removed = removed?;
        removed.forget_registrations();
        self.update_subscribers();
        Some(removed)
    }

    /// Remove every child without recording removals.
    pub(crate) fn clear_children(&self) {
        let children: Vec<Node> = {
            let mut state = self.0.state.lock();
            state.removed_children.clear();
            state.children.drain().map(|(_, n)| n).collect()
        };
        for child in children {
            child.forget_registrations();
        }
    }

    /// Resolve `path` relative to this node.  `"/"` and `""` resolve to
    /// `self`.
    pub fn get(&self, path: &str) -> Option<Node> {
        let mut node = self.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.child(segment)?;
        }
        Some(node)
    }

    // ── Actions ─────────────────────────────────────────────────────

    pub fn action(&self) -> Option<ActionHandler> {
        self.0.state.lock().action.clone()
    }

    /// Attach (or replace) the action and advertise it through configs.
    pub fn set_action(&self, handler: ActionHandler) {
        for (key, value) in handler.configs() {
            self.0.configs.set_quiet(key, value);
        }
        self.0.state.lock().action = Some(handler);
        self.update_subscribers();
    }

    // ── Remote writes ───────────────────────────────────────────────

    /// Listen for values written by the broker (not local sets).
    pub fn on_remote_set(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.0.remote_set.add(callback)
    }

    pub(crate) fn remote_set(&self, value: Value) {
        self.0.value.set(value.clone());
        self.0.remote_set.emit(&value);
    }

    // ── Subscribers & streams ───────────────────────────────────────

    pub(crate) fn add_subscriber(&self, sid: i64) {
        self.0.state.lock().subscribers.insert(sid);
    }

    pub(crate) fn remove_subscriber(&self, sid: i64) -> bool {
        self.0.state.lock().subscribers.remove(&sid)
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.state.lock().subscribers.len()
    }

    pub(crate) fn add_stream(&self, rid: i64) {
        self.0.state.lock().streams.insert(rid);
    }

    pub(crate) fn remove_stream(&self, rid: i64) -> bool {
        self.0.state.lock().streams.remove(&rid)
    }

    pub fn stream_count(&self) -> usize {
        self.0.state.lock().streams.len()
    }

    /// `[sid, value, ts]` for every subscriber, into the rid-0 buffer.
    pub(crate) fn push_value_update(&self, change: &ValueChange) {
        let sids: Vec<i64> = self.0.state.lock().subscribers.iter().copied().collect();
        if sids.is_empty() {
            return;
        }
        let Some(core) = self.core() else { return };
        let ts = format_timestamp(&change.timestamp);
        for sid in sids {
            core.outbound().add_value_update(Value::Array(vec![
                Value::Int(sid),
                change.value.clone(),
                Value::String(ts.clone()),
            ]));
        }
    }

    /// Re-send the node's list state to every open list stream, in one
    /// envelope.  No-op while building.
    pub fn update_subscribers(&self) {
        if self.is_building() {
            return;
        }
        let (streams, children, removed) = {
            let mut state = self.0.state.lock();
            if state.streams.is_empty() {
                state.removed_children.clear();
                return;
            }
            let mut streams: Vec<i64> = state.streams.iter().copied().collect();
            streams.sort_unstable();
            (
                streams,
                state.children.values().cloned().collect::<Vec<_>>(),
                std::mem::take(&mut state.removed_children),
            )
        };
        let Some(core) = self.core() else { return };

        let updates = self.build_list_updates(&children, &removed);
        let responses = streams
            .into_iter()
            .map(|rid| Response::open(rid, updates.clone()).to_value())
            .collect();
        core.outbound().enqueue(Envelope::with_responses(responses));
    }

    /// Drop every subscription and stream held on this subtree.
    fn forget_registrations(&self) {
        let (sids, rids, children) = {
            let mut state = self.0.state.lock();
            (
                state.subscribers.drain().collect::<Vec<_>>(),
                state.streams.drain().collect::<Vec<_>>(),
                state.children.values().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(core) = self.core() {
            core.forget(&sids, &rids);
        }
        for child in children {
            child.forget_registrations();
        }
    }

    // ── List encoding ───────────────────────────────────────────────

    /// Full list state: `$is` first, then configs, attributes, one entry
    /// per child and one remove marker per pending removal.
    pub fn list_updates(&self) -> Vec<Value> {
        let (children, removed) = {
            let state = self.0.state.lock();
            (
                state.children.values().cloned().collect::<Vec<_>>(),
                state.removed_children.clone(),
            )
        };
        self.build_list_updates(&children, &removed)
    }

    fn build_list_updates(&self, children: &[Node], removed: &[String]) -> Vec<Value> {
        let mut updates = Vec::new();
        let configs = self.0.configs.snapshot();
        updates.push(pair(
            "$is",
            configs.get("is").cloned().unwrap_or_else(|| "node".into()),
        ));
        for (key, value) in configs.iter().filter(|(k, _)| k.as_str() != "is") {
            updates.push(pair(&format!("${key}"), value.clone()));
        }
        for (key, value) in self.0.attributes.snapshot() {
            updates.push(pair(&format!("@{key}"), value));
        }

        let mut children: Vec<&Node> = children.iter().collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        for child in children {
            updates.push(pair(child.name(), child.summary()));
        }
        for name in removed {
            let mut marker = Value::map();
            marker.insert("name", name.as_str());
            marker.insert("change", "remove");
            updates.push(marker);
        }
        updates
    }

    /// What a parent's list shows for this node.
    fn summary(&self) -> Value {
        let mut map = Value::map();
        for (key, value) in self.0.configs.snapshot() {
            map.insert(format!("${key}"), value);
        }
        for (key, value) in self.0.attributes.snapshot() {
            map.insert(format!("@{key}"), value);
        }
        if self.0.value.timestamp().is_some() {
            map.insert("value", self.0.value.get());
        }
        map
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Snapshot of this subtree, private configs included.
    pub fn serialize(&self) -> Value {
        let mut map = Value::map();
        for (key, value) in self.0.configs.snapshot() {
            map.insert(format!("${key}"), value);
        }
        for (key, value) in self.0.attributes.snapshot() {
            map.insert(format!("@{key}"), value);
        }
        let (value, timestamp) = self.0.value.snapshot();
        if let Some(ts) = timestamp {
            map.insert(VALUE_KEY, value);
            map.insert(VALUE_TIMESTAMP_KEY, ts);
        }
        let private = self.0.private_configs.snapshot();
        if !private.is_empty() {
            map.insert(PRIVATE_CONFIGS_KEY, Value::Map(private));
        }
        for child in self.children() {
            map.insert(child.name().to_string(), child.serialize());
        }
        map
    }

    /// Populate this node from a [`serialize`](Self::serialize) snapshot.
    ///
    /// Children are built through the normal builder path, so node classes
    /// and pending list streams apply to them.  Entries with invalid names
    /// are skipped.
    pub fn deserialize(&self, snapshot: &Value) -> Result<()> {
        let map = snapshot
            .as_map()
            .ok_or_else(|| LinkError::Config(format!("snapshot for {} is not a map", self.path())))?;

        let mut value = None;
        let mut timestamp = None;
        for (key, entry) in map {
            if let Some(config) = key.strip_prefix('$') {
                self.0.configs.set_quiet(config, entry.clone());
            } else if let Some(attribute) = key.strip_prefix('@') {
                self.0.attributes.set_quiet(attribute, entry.clone());
            } else if key == VALUE_KEY {
                value = Some(entry.clone());
            } else if key == VALUE_TIMESTAMP_KEY {
                timestamp = entry.as_str().and_then(parse_timestamp);
            } else if key == PRIVATE_CONFIGS_KEY {
                if let Some(private) = entry.as_map() {
                    for (k, v) in private {
                        self.0.private_configs.set_quiet(k, v.clone());
                    }
                }
            } else if entry.as_map().is_some() {
                let builder = match self.create_child(key) {
                    Ok(builder) => builder,
                    Err(e) => {
                        tracing::warn!(parent = %self.path(), name = %key, error = %e, "skipping snapshot entry");
                        continue;
                    }
                };
                builder.node().deserialize(entry)?;
                if let Err(e) = builder.build() {
                    tracing::warn!(parent = %self.path(), name = %key, error = %e, "skipping snapshot entry");
                }
            }
        }
        if let Some(value) = value {
            self.0
                .value
                .restore(value, Some(timestamp.unwrap_or_else(dslink_protocol::now)));
        }
        Ok(())
    }

    /// Back to a bare node: no children, metadata or value.
    pub(crate) fn reset(&self) {
        self.clear_children();
        self.0.configs.clear_quiet();
        self.0.configs.set_quiet("is", "node".into());
        self.0.attributes.clear_quiet();
        self.0.private_configs.clear_quiet();
        self.0.value.restore(Value::Null, None);
        self.0.state.lock().action = None;
    }
}

impl NodeView for Node {
    fn name(&self) -> &str {
        Node::name(self)
    }

    fn path(&self) -> &str {
        Node::path(self)
    }

    fn config(&self, key: &str) -> Option<Value> {
        self.0.configs.get(key)
    }

    fn attribute(&self, key: &str) -> Option<Value> {
        self.0.attributes.get(key)
    }

    fn child_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.state.lock().children.keys().cloned().collect();
        names.sort();
        names
    }

    fn current_value(&self) -> Value {
        self.0.value.get()
    }
}

fn pair(key: &str, value: Value) -> Value {
    Value::Array(vec![Value::from(key), value])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_child_is_reachable_by_path() {
        let root = Node::detached_root();
        let a = root.create_child("a").unwrap().build().unwrap();
        let b = a.create_child("b c").unwrap().build().unwrap();

        assert_eq!(a.path(), "/a");
        assert_eq!(b.path(), "/a/b c");
        assert!(root.get("/a/b c").unwrap().ptr_eq(&b));
        assert!(root.get(b.path()).unwrap().ptr_eq(&b));
        assert!(root.get("/").unwrap().ptr_eq(&root));
        assert!(root.get("/a/missing").is_none());
        assert!(b.parent().unwrap().ptr_eq(&a));
    }

    #[test]
    fn every_banned_char_rejected() {
        let root = Node::detached_root();
        for c in BANNED_CHARS {
            let name = format!("x{c}");
            assert!(
                matches!(root.create_child(&name), Err(LinkError::InvalidNodeName(_))),
                "{name:?} accepted"
            );
        }
        assert!(root.create_child("").is_err());
        assert!(root.create_child("ok-name_1 (two)").is_ok());
    }

    #[test]
    fn duplicate_child_is_error() {
        let root = Node::detached_root();
        root.create_child("a").unwrap().build().unwrap();
        assert!(matches!(
            root.create_child("a").unwrap().build(),
            Err(LinkError::DuplicateChild(_))
        ));
    }

    #[test]
    fn unbuilt_child_is_invisible() {
        let root = Node::detached_root();
        let builder = root.create_child("pending").unwrap();
        assert!(builder.node().is_building());
        assert!(!root.has_child("pending"));
        let node = builder.build().unwrap();
        assert!(!node.is_building());
        assert!(root.has_child("pending"));
    }

    #[test]
    fn list_updates_shape() {
        let root = Node::detached_root();
        root.attributes().set("site", "roof");
        root.create_child("temp")
            .unwrap()
            .value_type("number")
            .value(123)
            .build()
            .unwrap();

        let updates = root.list_updates();
        assert_eq!(updates[0], pair("$is", "node".into()));
        assert!(updates.contains(&pair("@site", "roof".into())));

        let child = updates
            .iter()
            .find(|u| u.as_array().and_then(|a| a[0].as_str()) == Some("temp"))
            .and_then(|u| u.as_array().map(|a| a[1].clone()))
            .unwrap();
        assert_eq!(child.get("$type"), Some(&Value::from("number")));
        assert_eq!(child.get("value"), Some(&Value::Int(123)));
    }

    #[test]
    fn removed_child_leaves_list() {
        let root = Node::detached_root();
        root.create_child("gone").unwrap().build().unwrap();
        assert!(root.remove_child("gone").is_some());
        assert!(root.remove_child("gone").is_none());
        // The update cycle consumed the removal; nothing is listed for it.
        let updates = root.list_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0], pair("$is", "node".into()));
    }

    #[test]
    fn serialize_round_trip() {
        let root = Node::detached_root();
        root.configs().set("name", "Root");
        let a = root
            .create_child("a")
            .unwrap()
            .display_name("Alpha")
            .attribute("unit", "kW")
            .private_config("secret", "x")
            .value(1.5f64)
            .build()
            .unwrap();
        a.create_child("deep")
            .unwrap()
            .attribute("tags", Value::Array(vec!["t1".into(), 2.into()]))
            .config("writable", "write")
            .value(Value::Bytes(vec![1, 2, 3]))
            .build()
            .unwrap();

        let snapshot = root.serialize();
        assert_eq!(
            snapshot.get("a").and_then(|a| a.get("?privateConfigs")).and_then(|p| p.get("secret")),
            Some(&Value::from("x"))
        );

        let restored = Node::detached_root();
        restored.deserialize(&snapshot).unwrap();
        assert_eq!(restored.serialize(), snapshot);

        let deep = restored.get("/a/deep").unwrap();
        assert_eq!(deep.value().get(), Value::Bytes(vec![1, 2, 3]));
        assert_eq!(deep.config("writable"), Some(Value::from("write")));
        assert_eq!(restored.get("/a").unwrap().value().get(), a.value().get());
    }

    #[test]
    fn deserialize_skips_invalid_names() {
        let root = Node::detached_root();
        let snapshot: Value =
            serde_json::from_str(r#"{"$is":"node","good":{"$is":"node"},"bad.name":{"$is":"node"}}"#)
                .unwrap();
        root.deserialize(&snapshot).unwrap();
        assert_eq!(root.child_names(), vec!["good".to_string()]);
    }

    #[test]
    fn reset_clears_everything() {
        let root = Node::detached_root();
        root.create_child("a").unwrap().build().unwrap();
        root.attributes().set("x", 1);
        root.value().set(5);
        root.reset();
        assert!(root.children().is_empty());
        assert!(root.attributes().is_empty());
        assert_eq!(root.profile(), "node");
        assert!(root.value().timestamp().is_none());
    }
}
