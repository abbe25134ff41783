//! Config / attribute / private-config maps attached to a node.

use std::collections::BTreeMap;
use std::sync::Weak;

use dslink_protocol::Value;
use parking_lot::RwLock;

use super::{Node, NodeInner};
use crate::observer::{ListenerId, Listeners};

/// Which of a node's three metadata maps this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    /// `$`-prefixed, protocol-reserved.
    Config,
    /// `@`-prefixed, user metadata.
    Attribute,
    /// Local only; written to the snapshot, never to the wire.
    Private,
}

impl MetadataKind {
    pub fn prefix(&self) -> Option<char> {
        match self {
            MetadataKind::Config => Some('$'),
            MetadataKind::Attribute => Some('@'),
            MetadataKind::Private => None,
        }
    }
}

/// Emitted by [`MetadataMap::on_set`].  `value` is `None` on removal.
#[derive(Debug, Clone)]
pub struct MetadataChange {
    pub key: String,
    pub value: Option<Value>,
}

/// Keys are stored without their `$`/`@` prefix; every accessor accepts
/// either form.
pub struct MetadataMap {
    kind: MetadataKind,
    owner: Weak<NodeInner>,
    entries: RwLock<BTreeMap<String, Value>>,
    on_set: Listeners<MetadataChange>,
}

impl MetadataMap {
    pub(crate) fn new(kind: MetadataKind, owner: Weak<NodeInner>) -> Self {
        Self {
            kind,
            owner,
            entries: RwLock::new(BTreeMap::new()),
            on_set: Listeners::new(),
        }
    }

    pub fn kind(&self) -> MetadataKind {
        self.kind
    }

    fn key<'a>(&self, key: &'a str) -> &'a str {
        match self.kind.prefix() {
            Some(prefix) => key.strip_prefix(prefix).unwrap_or(key),
            None => key,
        }
    }

    /// Wire form of a stored key (`is` → `$is`).
    pub fn wire_key(&self, key: &str) -> String {
        match self.kind.prefix() {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(self.key(key)).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(self.key(key))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of every entry, keys unprefixed.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().clone()
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.set_quiet(key, value.into());
        self.changed(MetadataChange {
            key: self.key(key).to_string(),
            value: self.get(key),
        });
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.entries.write().remove(self.key(key));
        if removed.is_some() {
            self.changed(MetadataChange {
                key: self.key(key).to_string(),
                value: None,
            });
        }
        removed
    }

    pub fn on_set(&self, callback: impl Fn(&MetadataChange) + Send + Sync + 'static) -> ListenerId {
        self.on_set.add(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.on_set.remove(id)
    }

    /// Insert without notifying listeners or list streams.
    pub(crate) fn set_quiet(&self, key: &str, value: Value) {
        self.entries.write().insert(self.key(key).to_string(), value);
    }

    pub(crate) fn clear_quiet(&self) {
        self.entries.write().clear();
    }

    fn changed(&self, change: MetadataChange) {
        self.on_set.emit(&change);
        if self.kind == MetadataKind::Private {
            return;
        }
        if let Some(inner) = self.owner.upgrade() {
            Node::from_inner(inner).update_subscribers();
        }
    }
}
