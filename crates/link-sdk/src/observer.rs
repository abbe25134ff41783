//! Explicit observer registration.
//!
//! Callbacks run synchronously, in registration order, on the thread that
//! triggered the event.  The registry lock is released before any callback
//! runs, so a callback may register or remove listeners (including itself).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by [`Listeners::add`]; pass it to [`Listeners::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> =
            self.entries.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in snapshot {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::<u32>::new();
        for tag in ["a", "b", "c"] {
            let log = log.clone();
            listeners.add(move |v| log.lock().push(format!("{tag}{v}")));
        }
        listeners.emit(&1);
        assert_eq!(*log.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn removed_listener_stops_firing() {
        let hits = Arc::new(AtomicU64::new(0));
        let listeners = Listeners::<()>::new();
        let h = hits.clone();
        let id = listeners.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        listeners.emit(&());
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_register_listeners() {
        let listeners = Arc::new(Listeners::<()>::new());
        let inner = listeners.clone();
        listeners.add(move |_| {
            inner.add(|_| {});
        });
        listeners.emit(&());
        assert_eq!(listeners.len(), 2);
    }
}
