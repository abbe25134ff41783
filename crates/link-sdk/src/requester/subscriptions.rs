use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dslink_protocol::{SubscribePath, SubscriptionUpdate};

pub type SubscriptionCallback = Arc<dyn Fn(&SubscriptionUpdate) + Send + Sync>;

struct RemoteSubscription {
    path: String,
    qos: Option<i64>,
    /// Virtual sid → callback, in subscription order.
    callbacks: BTreeMap<i64, SubscriptionCallback>,
}

/// Collapses local subscriptions onto one wire sid per path.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    by_sid: HashMap<i64, RemoteSubscription>,
    sid_by_path: HashMap<String, i64>,
    sid_by_virtual: HashMap<i64, i64>,
}

impl SubscriptionTable {
    /// Register a local subscriber.  Returns the wire entry to send when
    /// this is the first subscriber for `path`.
    pub(crate) fn add(
        &mut self,
        path: &str,
        qos: Option<i64>,
        virtual_sid: i64,
        callback: SubscriptionCallback,
        allocate_sid: impl FnOnce() -> i64,
    ) -> Option<SubscribePath> {
        if let Some(&sid) = self.sid_by_path.get(path) {
            if let Some(sub) = self.by_sid.get_mut(&sid) {
                sub.callbacks.insert(virtual_sid, callback);
                self.sid_by_virtual.insert(virtual_sid, sid);
                return None;
            }
        }

        let sid = allocate_sid();
        let mut callbacks = BTreeMap::new();
        callbacks.insert(virtual_sid, callback);
        self.by_sid.insert(
            sid,
            RemoteSubscription {
                path: path.to_string(),
                qos,
                callbacks,
            },
        );
        self.sid_by_path.insert(path.to_string(), sid);
        self.sid_by_virtual.insert(virtual_sid, sid);
        Some(SubscribePath {
            path: path.to_string(),
            sid,
            qos,
        })
    }

    /// Drop a local subscriber.  `Ok(Some(sid))` means it was the last one
    /// and the wire subscription should go too; `Err(())` means the virtual
    /// sid is unknown.
    pub(crate) fn remove(&mut self, virtual_sid: i64) -> Result<Option<i64>, ()> {
        let sid = self.sid_by_virtual.remove(&virtual_sid).ok_or(())?;
        let Some(sub) = self.by_sid.get_mut(&sid) else {
            return Err(());
        };
        sub.callbacks.remove(&virtual_sid);
        if !sub.callbacks.is_empty() {
            return Ok(None);
        }
        if let Some(sub) = self.by_sid.remove(&sid) {
            self.sid_by_path.remove(&sub.path);
        }
        Ok(Some(sid))
    }

    pub(crate) fn callbacks(&self, sid: i64) -> Option<Vec<SubscriptionCallback>> {
        self.by_sid
            .get(&sid)
            .map(|sub| sub.callbacks.values().cloned().collect())
    }

    /// Every live wire subscription, for re-subscribing after reconnect.
    pub(crate) fn wire_paths(&self) -> Vec<SubscribePath> {
        let mut paths: Vec<SubscribePath> = self
            .by_sid
            .iter()
            .map(|(sid, sub)| SubscribePath {
                path: sub.path.clone(),
                sid: *sid,
                qos: sub.qos,
            })
            .collect();
        paths.sort_by_key(|p| p.sid);
        paths
    }

    pub(crate) fn len(&self) -> usize {
        self.by_sid.len()
    }
}
