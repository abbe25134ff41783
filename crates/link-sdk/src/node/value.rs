//! A node's timestamped value.

use std::sync::Weak;

use dslink_protocol::{format_timestamp, Timestamp, Value};
use parking_lot::Mutex;

use super::{Node, NodeInner};
use crate::observer::{ListenerId, Listeners};

/// Emitted to [`NodeValue::on_set`] listeners after a real change.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub value: Value,
    pub timestamp: Timestamp,
}

#[derive(Default)]
struct Current {
    value: Value,
    timestamp: Option<Timestamp>,
}

pub struct NodeValue {
    owner: Weak<NodeInner>,
    current: Mutex<Current>,
    on_set: Listeners<ValueChange>,
}

impl NodeValue {
    pub(crate) fn new(owner: Weak<NodeInner>) -> Self {
        Self {
            owner,
            current: Mutex::new(Current::default()),
            on_set: Listeners::new(),
        }
    }

    pub fn get(&self) -> Value {
        self.current.lock().value.clone()
    }

    /// `None` until the first set.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.current.lock().timestamp
    }

    /// `[value, "timestamp"]`-style pair used by subscription updates.
    pub(crate) fn snapshot(&self) -> (Value, Option<String>) {
        let current = self.current.lock();
        (
            current.value.clone(),
            current.timestamp.as_ref().map(format_timestamp),
        )
    }

    /// Set to `value`, stamped now.  Returns whether anything changed.
    pub fn set(&self, value: impl Into<Value>) -> bool {
        self.apply(value.into(), None, false)
    }

    /// Set even if `value` equals the current one.
    pub fn set_forced(&self, value: impl Into<Value>) -> bool {
        self.apply(value.into(), None, true)
    }

    pub fn set_with_timestamp(&self, value: impl Into<Value>, timestamp: Timestamp, force: bool) -> bool {
        self.apply(value.into(), Some(timestamp), force)
    }

    pub fn on_set(&self, callback: impl Fn(&ValueChange) + Send + Sync + 'static) -> ListenerId {
        self.on_set.add(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.on_set.remove(id)
    }

    /// Restore a persisted value without notifying anyone.
    pub(crate) fn restore(&self, value: Value, timestamp: Option<Timestamp>) {
        *self.current.lock() = Current { value, timestamp };
    }

    fn apply(&self, value: Value, timestamp: Option<Timestamp>, force: bool) -> bool {
        let change = {
            let mut current = self.current.lock();
            // A never-set value always counts as a change, even to null.
            if !force && current.timestamp.is_some() && current.value == value {
                return false;
            }
            let timestamp = timestamp.unwrap_or_else(dslink_protocol::now);
            current.value = value.clone();
            current.timestamp = Some(timestamp);
            ValueChange { value, timestamp }
        };

        self.on_set.emit(&change);
        if let Some(inner) = self.owner.upgrade() {
            Node::from_inner(inner).push_value_update(&change);
        }
        true
    }
}
