//! Change notification for stores
//!
//! Listeners subscribe to one store and get the keys touched by each
//! committed write together with its origin. Delivery runs on a dedicated
//! thread per store, fed through a channel, so a slow listener never
//! delays the writer. The set of listeners is captured when the write
//! commits: a listener added afterwards does not see that write.

use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::SyncResult;
use crate::storage::{RawVersioned, StoreStage};
use crate::sync::byte_array::ByteArray;

/// Where a committed write came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// Written through a client on this node
    Local,
    /// Received from a peer or during bootstrap
    Remote,
}

pub trait StoreListener: Send + Sync {
    fn key_updated(&self, keys: &[ByteArray], origin: UpdateOrigin) -> anyhow::Result<()>;
}

impl<F> StoreListener for F
where
    F: Fn(&[ByteArray], UpdateOrigin) -> anyhow::Result<()> + Send + Sync,
{
    fn key_updated(&self, keys: &[ByteArray], origin: UpdateOrigin) -> anyhow::Result<()> {
        self(keys, origin)
    }
}

type ListenerList = RwLock<Vec<(u64, Arc<dyn StoreListener>)>>;

struct Notification {
    keys: Vec<ByteArray>,
    origin: UpdateOrigin,
    listeners: Vec<Arc<dyn StoreListener>>,
}

/// Pipeline stage that fans committed writes out to listeners
pub struct ListenerStage {
    store: String,
    listeners: Arc<ListenerList>,
    next_id: AtomicU64,
    tx: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerStage {
    pub fn new(store: impl Into<String>) -> SyncResult<Self> {
        let store = store.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name(format!("notify-{}", store))
            .spawn({
                let store = store.clone();
                move || deliver_loop(store, rx)
            })?;

        Ok(Self {
            store,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Register a listener. Dropping the handle keeps the subscription;
    /// call [`ListenerHandle::unsubscribe`] to remove it.
    pub fn subscribe(&self, listener: Arc<dyn StoreListener>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        ListenerHandle {
            id,
            store: self.store.clone(),
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Queue a notification for the current listeners
    pub fn publish(&self, keys: Vec<ByteArray>, origin: UpdateOrigin) {
        let listeners: Vec<Arc<dyn StoreListener>> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        if listeners.is_empty() {
            return;
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Notification {
                keys,
                origin,
                listeners,
            });
        }
    }

    /// Stop accepting notifications and wait for queued ones to be delivered
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Notification thread for store '{}' panicked", self.store);
            }
        }
    }
}

impl Drop for ListenerStage {
    fn drop(&mut self) {
        self.tx.lock().take();
    }
}

impl StoreStage for ListenerStage {
    fn name(&self) -> &'static str {
        "listeners"
    }

    fn after_write(
        &self,
        _store: &str,
        key: &ByteArray,
        _values: &[RawVersioned],
        origin: UpdateOrigin,
    ) -> SyncResult<()> {
        self.publish(vec![key.clone()], origin);
        Ok(())
    }
}

fn deliver_loop(store: String, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.blocking_recv() {
        for listener in &notification.listeners {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.key_updated(&notification.keys, notification.origin)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener on store '{}' failed: {}", store, e),
                Err(_) => error!("Listener on store '{}' panicked", store),
            }
        }
    }
    debug!("Notification thread for store '{}' stopped", store);
}

/// Subscription returned by [`ListenerStage::subscribe`]
pub struct ListenerHandle {
    id: u64,
    store: String,
    listeners: Weak<ListenerList>,
}

impl ListenerHandle {
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Remove the listener. Notifications already queued may still arrive.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn channel_listener() -> (Arc<dyn StoreListener>, std_mpsc::Receiver<(Vec<ByteArray>, UpdateOrigin)>) {
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        let listener = move |keys: &[ByteArray], origin: UpdateOrigin| -> anyhow::Result<()> {
            tx.lock().send((keys.to_vec(), origin))?;
            Ok(())
        };
        (Arc::new(listener), rx)
    }

    #[test]
    fn test_publish_reaches_every_listener_once() {
        let stage = ListenerStage::new("s").unwrap();
        let (a, rx_a) = channel_listener();
        let (b, rx_b) = channel_listener();
        stage.subscribe(a);
        stage.subscribe(b);

        stage.publish(vec![ByteArray::from("k")], UpdateOrigin::Local);
        for rx in [&rx_a, &rx_b] {
            let (keys, origin) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(keys, vec![ByteArray::from("k")]);
            assert_eq!(origin, UpdateOrigin::Local);
            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        }
        stage.shutdown();
    }

    #[test]
    fn test_unsubscribe_and_late_subscription() {
        let stage = ListenerStage::new("s").unwrap();
        let (a, rx_a) = channel_listener();
        let handle = stage.subscribe(a);
        handle.unsubscribe();
        assert_eq!(stage.listener_count(), 0);

        stage.publish(vec![ByteArray::from("k")], UpdateOrigin::Remote);
        let (late, rx_late) = channel_listener();
        stage.subscribe(late);
        stage.shutdown();

        assert!(rx_a.try_recv().is_err());
        assert!(rx_late.try_recv().is_err());
    }

    #[test]
    fn test_failing_listener_does_not_stop_delivery() {
        let stage = ListenerStage::new("s").unwrap();
        let broken = |_: &[ByteArray], _: UpdateOrigin| -> anyhow::Result<()> {
            anyhow::bail!("broken listener")
        };
        let panicking = |_: &[ByteArray], _: UpdateOrigin| -> anyhow::Result<()> {
            panic!("listener panic")
        };
        stage.subscribe(Arc::new(broken));
        stage.subscribe(Arc::new(panicking));
        let (ok, rx) = channel_listener();
        stage.subscribe(ok);

        stage.publish(vec![ByteArray::from("a")], UpdateOrigin::Local);
        stage.publish(vec![ByteArray::from("b")], UpdateOrigin::Local);
        stage.shutdown();

        let received: Vec<_> = rx.try_iter().map(|(keys, _)| keys[0].clone()).collect();
        assert_eq!(received, vec![ByteArray::from("a"), ByteArray::from("b")]);
    }
}
