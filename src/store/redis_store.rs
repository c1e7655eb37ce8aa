//! Redis-backed shared store.
//!
//! Values live as JSON strings under `{prefix}:{path}`. Every write is also
//! published as a JSON [`StoreUpdate`] on `{prefix}:updates`, which is what
//! watchers subscribe to. A watcher subscribes before it snapshots existing
//! keys, so a write racing the snapshot may be delivered twice.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde_json::Value;

use super::{is_under, StateStore, StoreUpdate, Subscription};
use crate::error::{RelayError, Result};

pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisStore {
    /// Connect to the Redis server at `url`, namespacing all keys by `prefix`.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| RelayError::Store(format!("Failed to open Redis client: {}", e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RelayError::Store(format!("Redis connection error: {}", e)))?;

        tracing::info!(url, prefix, "Connected to Redis store");

        Ok(Self {
            client,
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, path: &str) -> String {
        format!("{}:{}", self.prefix, path)
    }

    fn path_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?.strip_prefix(':')
    }

    fn channel(&self) -> String {
        format!("{}:updates", self.prefix)
    }
}

/// Escape glob metacharacters so ids match literally in `SCAN MATCH`.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl StateStore for RedisStore {
    async fn put(&self, path: &str, value: Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&value)?;
        let _: () = conn.set(self.key(path), json).await?;

        let event = serde_json::to_string(&StoreUpdate::new(path, value))?;
        let _: () = conn.publish(self.channel(), event).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(path)).await?;
        match raw {
            Some(json) => {
                let value: Value = serde_json::from_str(&json)?;
                Ok(Some(value).filter(|v| !v.is_null()))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoreUpdate>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(&self.key(prefix.trim_end_matches('/'))));
        let mut keys: Vec<String> = conn.scan_match::<_, String>(&pattern).await?.collect().await;
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(path) = self.path_of(&key) else {
                continue;
            };
            if !is_under(path, prefix) {
                continue;
            }
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(json) = raw {
                match serde_json::from_str(&json) {
                    Ok(value) => entries.push(StoreUpdate::new(path, value)),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping non-JSON store entry")
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn watch(&self, prefix: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel()).await?;

        let snapshot = self.list(prefix).await?;
        let prefix = prefix.to_string();

        let live = pubsub.into_on_message().filter_map(move |msg| {
            let update = msg
                .get_payload::<String>()
                .ok()
                .and_then(|payload| serde_json::from_str::<StoreUpdate>(&payload).ok())
                .filter(|update| is_under(&update.path, &prefix));
            futures::future::ready(update)
        });

        Ok(Subscription::new(futures::stream::iter(snapshot).chain(live)))
    }
}
