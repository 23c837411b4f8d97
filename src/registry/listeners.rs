//! Removable subscriber lists for registry notifications

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by [`Listeners::add`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of callbacks notified in registration order.
///
/// Callbacks run on the notifying task after the subscriber list lock is
/// released, so a callback may add or remove listeners or query the
/// registry without deadlocking.
pub struct Listeners<T> {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl<T> Listeners<T> {
    pub fn add<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.subscribers.write() {
            Ok(mut guard) => guard.push((id, Arc::new(callback))),
            Err(e) => tracing::warn!("Listener list lock poisoned on add: {e}"),
        }
        id
    }

    /// Returns false if the id was not registered
    pub fn remove(&self, id: ListenerId) -> bool {
        match self.subscribers.write() {
            Ok(mut guard) => {
                let before = guard.len();
                guard.retain(|(existing, _)| *existing != id);
                guard.len() != before
            }
            Err(e) => {
                tracing::warn!("Listener list lock poisoned on remove: {e}");
                false
            }
        }
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = match self.subscribers.read() {
            Ok(guard) => guard.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(e) => {
                tracing::warn!("Listener list lock poisoned on notify: {e}");
                return;
            }
        };

        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn notifies_every_subscriber() {
        let listeners: Listeners<u32> = Listeners::default();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = Arc::clone(&total);
            listeners.add(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        listeners.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn removed_subscriber_is_not_called() {
        let listeners: Listeners<u32> = Listeners::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let id = {
            let calls = Arc::clone(&calls);
            listeners.add(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id), "second remove is a no-op");
        listeners.notify(&1);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(listeners.is_empty());
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let listeners: Arc<Listeners<u32>> = Arc::new(Listeners::default());
        let slot: Arc<RwLock<Option<ListenerId>>> = Arc::new(RwLock::new(None));

        let id = {
            let inner = Arc::clone(&listeners);
            let slot = Arc::clone(&slot);
            listeners.add(move |_| {
                if let Some(id) = *slot.read().unwrap() {
                    inner.remove(id);
                }
            })
        };
        *slot.write().unwrap() = Some(id);

        listeners.notify(&0);
        assert!(listeners.is_empty());
    }
}
