use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::node::{InvokeState, Node};

pub(crate) enum OpenStream {
    List(Node),
    Invoke(Arc<InvokeState>),
}

/// Open list/invoke streams by rid, plus list requests waiting for their
/// node to appear.
#[derive(Default)]
pub(crate) struct StreamManager {
    open: Mutex<HashMap<i64, OpenStream>>,
    pending_lists: Mutex<HashMap<String, Vec<i64>>>,
}

impl StreamManager {
    pub(crate) fn open_list(&self, rid: i64, node: &Node) {
        node.add_stream(rid);
        self.open.lock().insert(rid, OpenStream::List(node.clone()));
    }

    pub(crate) fn defer_list(&self, path: &str, rid: i64) {
        self.pending_lists
            .lock()
            .entry(normalize(path))
            .or_default()
            .push(rid);
    }

    /// List rids waiting for `path`.
    pub(crate) fn take_pending(&self, path: &str) -> Vec<i64> {
        self.pending_lists
            .lock()
            .remove(&normalize(path))
            .unwrap_or_default()
    }

    pub(crate) fn open_invoke(&self, rid: i64, state: Arc<InvokeState>) {
        self.open.lock().insert(rid, OpenStream::Invoke(state));
    }

    /// Remote close: deregister and cancel.  Returns whether `rid` was known.
    pub(crate) fn close(&self, rid: i64) -> bool {
        let removed = self.open.lock().remove(&rid);
        let mut found = removed.is_some();
        match removed {
            Some(OpenStream::List(node)) => {
                node.remove_stream(rid);
            }
            Some(OpenStream::Invoke(state)) => {
                state.closed.store(true, Ordering::SeqCst);
                state.cancel.cancel();
            }
            None => {}
        }
        let mut pending = self.pending_lists.lock();
        for rids in pending.values_mut() {
            let before = rids.len();
            rids.retain(|r| *r != rid);
            found |= rids.len() != before;
        }
        pending.retain(|_, rids| !rids.is_empty());
        found
    }

    /// Deregister a finished invocation, unless `rid` has been reused.
    pub(crate) fn release_invoke(&self, rid: i64, state: &Arc<InvokeState>) {
        let mut open = self.open.lock();
        if matches!(open.get(&rid), Some(OpenStream::Invoke(s)) if Arc::ptr_eq(s, state)) {
            open.remove(&rid);
        }
    }

    /// Drop bookkeeping for rids whose node already forgot them.
    pub(crate) fn forget(&self, rids: &[i64]) {
        let mut open = self.open.lock();
        for rid in rids {
            open.remove(rid);
        }
    }

    /// Forget everything.  Invocations are marked closed and their tokens
    /// fire; the handler tasks themselves keep running until they return.
    pub(crate) fn clear(&self) {
        let drained: Vec<(i64, OpenStream)> = self.open.lock().drain().collect();
        for (rid, stream) in drained {
            match stream {
                OpenStream::List(node) => {
                    node.remove_stream(rid);
                }
                OpenStream::Invoke(state) => {
                    state.closed.store(true, Ordering::SeqCst);
                    state.cancel.cancel();
                }
            }
        }
        self.pending_lists.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.open.lock().len()
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".into()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
