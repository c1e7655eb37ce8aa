//! Shared state store abstraction.
//!
//! Hosts coordinate exclusively through an eventually-consistent key-value
//! store addressed by slash-separated paths. This module defines the raw
//! store contract and the backends:
//!
//! - [`MemoryStore`]: in-process replica, shared between simulated hosts via `Arc`
//! - [`RedisStore`]: Redis keys for values plus a pub/sub channel for updates
//!
//! [`SharedState`] layers typed reads and writes of the domain records on top.
//!
//! # Delivery contract
//!
//! [`StateStore::watch`] is **at-least-once**: a subscriber sees every value
//! present under the prefix at subscription time and every later update, but
//! may also see the same value more than once, or an older value after a
//! newer one. Consumers must be idempotent.

pub mod client;
pub mod memory;
pub mod redis_store;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use client::{paths, SharedState};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// One observed value at a path. A `Null` value means the path is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub path: String,
    pub value: Value,
}

impl StoreUpdate {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }

    /// Last path segment, e.g. the request id for `executionRequests/h/<id>`.
    pub fn key(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Stream of updates returned by [`StateStore::watch`].
pub struct Subscription {
    stream: Pin<Box<dyn Stream<Item = StoreUpdate> + Send>>,
}

impl Subscription {
    pub fn new(stream: impl Stream<Item = StoreUpdate> + Send + 'static) -> Self {
        Self {
            stream: Box::pin(stream),
        }
    }

    /// Wait for the next update. Returns `None` once the store side is gone.
    pub async fn next(&mut self) -> Option<StoreUpdate> {
        self.stream.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upsert `value` at `path`. Conflicts resolve last-write-wins.
    async fn put(&self, path: &str, value: Value) -> Result<()>;

    /// Point read of the local replica; may be stale relative to peers.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Snapshot of every entry at or under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<StoreUpdate>>;

    /// Subscribe to every update at or under `prefix`, starting with the
    /// values currently present.
    async fn watch(&self, prefix: &str) -> Result<Subscription>;
}

/// Whether `path` equals `prefix` or lies beneath it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
