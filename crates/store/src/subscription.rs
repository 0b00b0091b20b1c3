use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// One push from the store: either a full snapshot of the watched list or a
/// terminal channel failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent<T> {
    Snapshot(Vec<T>),
    Lost { reason: String },
}

/// Cancellable snapshot stream returned by the gateway subscribe operations.
///
/// Dropping the subscription unsubscribes; no further snapshots are delivered.
pub struct Subscription<T> {
    events: mpsc::UnboundedReceiver<SubscriptionEvent<T>>,
    _unsubscribe: Unsubscribe,
}

impl<T> Subscription<T> {
    /// Builds a subscription plus its sending half.
    ///
    /// `unsubscribe` runs exactly once when the subscription is dropped.
    pub fn channel(
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> (mpsc::UnboundedSender<SubscriptionEvent<T>>, Self) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            event_tx,
            Self {
                events: event_rx,
                _unsubscribe: Unsubscribe(Some(Box::new(unsubscribe))),
            },
        )
    }

    pub fn try_recv(&mut self) -> Option<SubscriptionEvent<T>> {
        self.events.try_recv().ok()
    }
}

struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

struct Watcher<T> {
    token: u64,
    sender: mpsc::UnboundedSender<SubscriptionEvent<T>>,
}

/// Fan-out registry keyed by entity id, shared by the gateway implementations.
///
/// Every mutating store call re-queries the affected snapshot and pushes it to
/// all watchers of that key; senders whose receiving side is gone are pruned.
pub(crate) struct WatcherHub<T> {
    watchers: Mutex<HashMap<String, Vec<Watcher<T>>>>,
    next_token: AtomicU64,
}

impl<T: Clone + Send + 'static> WatcherHub<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            watchers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Registers a watcher for `key` and delivers `initial` as the first push.
    pub(crate) fn subscribe(self: &Arc<Self>, key: &str, initial: Vec<T>) -> Subscription<T> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let hub = Arc::clone(self);
        let unsubscribe_key = key.to_string();

        let (event_tx, subscription) = Subscription::channel(move || {
            hub.remove(&unsubscribe_key, token);
        });

        let _ = event_tx.send(SubscriptionEvent::Snapshot(initial));

        let mut watchers = self.watchers.lock().expect("watcher registry poisoned");
        watchers.entry(key.to_string()).or_default().push(Watcher {
            token,
            sender: event_tx,
        });

        subscription
    }

    /// Pushes a fresh snapshot to every live watcher of `key`.
    pub(crate) fn push(&self, key: &str, snapshot: Vec<T>) {
        let mut watchers = self.watchers.lock().expect("watcher registry poisoned");
        let Some(entries) = watchers.get_mut(key) else {
            return;
        };

        entries.retain(|watcher| {
            watcher
                .sender
                .send(SubscriptionEvent::Snapshot(snapshot.clone()))
                .is_ok()
        });

        if entries.is_empty() {
            watchers.remove(key);
        }
    }

    fn remove(&self, key: &str, token: u64) {
        let mut watchers = self.watchers.lock().expect("watcher registry poisoned");
        if let Some(entries) = watchers.get_mut(key) {
            entries.retain(|watcher| watcher.token != token);
            if entries.is_empty() {
                watchers.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_delivers_initial_snapshot_then_pushes() {
        let hub: Arc<WatcherHub<u32>> = WatcherHub::new();
        let mut subscription = hub.subscribe("a", vec![1, 2]);

        assert_eq!(
            subscription.try_recv(),
            Some(SubscriptionEvent::Snapshot(vec![1, 2]))
        );

        hub.push("a", vec![1, 2, 3]);
        assert_eq!(
            subscription.try_recv(),
            Some(SubscriptionEvent::Snapshot(vec![1, 2, 3]))
        );
        assert_eq!(subscription.try_recv(), None);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters_watcher() {
        let hub: Arc<WatcherHub<u32>> = WatcherHub::new();
        let subscription = hub.subscribe("a", Vec::new());
        drop(subscription);

        // Push after drop must not panic and must prune the key.
        hub.push("a", vec![9]);
        assert!(hub.watchers.lock().unwrap().get("a").is_none());
    }

    #[tokio::test]
    async fn pushes_are_keyed() {
        let hub: Arc<WatcherHub<u32>> = WatcherHub::new();
        let mut left = hub.subscribe("left", Vec::new());
        let mut right = hub.subscribe("right", Vec::new());
        let _ = left.try_recv();
        let _ = right.try_recv();

        hub.push("left", vec![7]);
        assert_eq!(left.try_recv(), Some(SubscriptionEvent::Snapshot(vec![7])));
        assert_eq!(right.try_recv(), None);
    }
}
