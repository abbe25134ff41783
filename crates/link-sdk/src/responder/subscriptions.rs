use std::collections::HashMap;

use dslink_protocol::Value;
use parking_lot::Mutex;

use crate::connection::Outbound;
use crate::node::Node;

/// sid → node for every value subscription the broker holds on us.
#[derive(Default)]
pub(crate) struct SubscriptionManager {
    by_sid: Mutex<HashMap<i64, Node>>,
}

impl SubscriptionManager {
    /// Register `sid` on `node` and send its current value.
    pub(crate) fn subscribe(&self, sid: i64, node: &Node, outbound: &dyn Outbound) {
        let previous = self.by_sid.lock().insert(sid, node.clone());
        if let Some(previous) = previous {
            if !previous.ptr_eq(node) {
                previous.remove_subscriber(sid);
            }
        }
        node.add_subscriber(sid);

        let (value, ts) = node.value().snapshot();
        outbound.add_value_update(Value::Array(vec![Value::Int(sid), value, ts.into()]));
        tracing::debug!(sid, path = %node.path(), "subscribed");
    }

    pub(crate) fn unsubscribe(&self, sid: i64) -> bool {
        let node = self.by_sid.lock().remove(&sid);
        match node {
            Some(node) => {
                node.remove_subscriber(sid);
                true
            }
            None => false,
        }
    }

    /// Drop bookkeeping for sids whose node already forgot them.
    pub(crate) fn forget(&self, sids: &[i64]) {
        let mut by_sid = self.by_sid.lock();
        for sid in sids {
            by_sid.remove(sid);
        }
    }

    pub(crate) fn clear(&self) {
        let drained: Vec<(i64, Node)> = self.by_sid.lock().drain().collect();
        for (sid, node) in drained {
            node.remove_subscriber(sid);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_sid.lock().len()
    }
}
