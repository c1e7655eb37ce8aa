use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{is_under, StateStore, StoreUpdate, Subscription};
use crate::error::Result;

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreUpdate>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Value>,
    watchers: Vec<Watcher>,
    /// Accepted writes, kept only by [`MemoryStore::recording`]
    history: Option<Vec<StoreUpdate>>,
}

/// In-process store.
///
/// Every watcher gets its own unbounded channel, so delivery is lossless.
/// Several simulated hosts may share one instance through an `Arc`, which
/// behaves like a store with instantaneous replication. [`MemoryStore::replay`]
/// injects the stale or duplicate notifications a replicated store produces.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that also keeps every accepted write for inspection.
    pub fn recording() -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: Some(Vec::new()),
                ..Default::default()
            }),
        }
    }

    /// Deliver `value` at `path` to matching watchers without changing the
    /// stored entry, simulating a replayed notification from a peer.
    pub async fn replay(&self, path: &str, value: Value) {
        let mut inner = self.inner.lock().await;
        let update = StoreUpdate::new(path, value);
        inner.notify(&update);
    }

    /// Every write accepted so far, oldest first. Empty unless the store
    /// was built with [`MemoryStore::recording`].
    pub async fn writes(&self) -> Vec<StoreUpdate> {
        self.inner.lock().await.history.clone().unwrap_or_default()
    }

    /// Writes at or under `prefix`, oldest first.
    pub async fn writes_under(&self, prefix: &str) -> Vec<StoreUpdate> {
        self.inner
            .lock()
            .await
            .history
            .iter()
            .flatten()
            .filter(|u| is_under(&u.path, prefix))
            .cloned()
            .collect()
    }
}

impl Inner {
    fn notify(&mut self, update: &StoreUpdate) {
        // Drop watchers whose subscription has been dropped
        self.watchers.retain(|w| {
            if !is_under(&update.path, &w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(update.clone()).is_ok()
        });
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, path: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let update = StoreUpdate::new(path, value.clone());
        inner.entries.insert(path.to_string(), value);
        if let Some(history) = inner.history.as_mut() {
            history.push(update.clone());
        }
        inner.notify(&update);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(path).filter(|v| !v.is_null()).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoreUpdate>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|(path, _)| is_under(path, prefix))
            .map(|(path, value)| StoreUpdate::new(path.clone(), value.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<Subscription> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        for (path, value) in inner.entries.iter() {
            if is_under(path, prefix) {
                let _ = tx.send(StoreUpdate::new(path.clone(), value.clone()));
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Subscription::new(UnboundedReceiverStream::new(rx)))
    }
}
