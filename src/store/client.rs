use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{StateStore, Subscription};
use crate::dispatch::{ClientStatusRecord, ExecutionRequest};
use crate::error::Result;
use crate::resources::HostResourceRecord;

/// Store paths shared by every host and client.
pub mod paths {
    pub const RESOURCES: &str = "resources";
    pub const EXECUTION_REQUESTS: &str = "executionRequests";
    pub const PROCESSED_REQUESTS: &str = "processedRequests";
    pub const CLIENTS: &str = "clients";

    pub fn resources(host_id: &str) -> String {
        format!("{}/{}", RESOURCES, host_id)
    }

    /// Root under which requests addressed to `host_id` live.
    pub fn request_root(host_id: &str) -> String {
        format!("{}/{}", EXECUTION_REQUESTS, host_id)
    }

    pub fn request(host_id: &str, request_id: &str) -> String {
        format!("{}/{}/{}", EXECUTION_REQUESTS, host_id, request_id)
    }

    pub fn ledger(request_id: &str) -> String {
        format!("{}/{}", PROCESSED_REQUESTS, request_id)
    }

    pub fn client(client_id: &str) -> String {
        format!("{}/{}", CLIENTS, client_id)
    }
}

/// Typed access to the shared store.
#[derive(Clone)]
pub struct SharedState {
    store: Arc<dyn StateStore>,
}

impl SharedState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub async fn put_json<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.store.put(path, value).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.store.get(path).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn watch(&self, prefix: &str) -> Result<Subscription> {
        self.store.watch(prefix).await
    }

    // Resources

    pub async fn publish_resources(&self, record: &HostResourceRecord) -> Result<()> {
        self.put_json(&paths::resources(&record.host_id), record).await
    }

    pub async fn host_resources(&self, host_id: &str) -> Result<Option<HostResourceRecord>> {
        self.get_json(&paths::resources(host_id)).await
    }

    /// Every advertised host. Records that fail to parse are skipped.
    pub async fn list_resources(&self) -> Result<Vec<HostResourceRecord>> {
        let entries = self.store.list(paths::RESOURCES).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry.value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::debug!(
                        path = %entry.path,
                        error = %e,
                        "Skipping malformed resource record"
                    );
                    None
                }
            })
            .collect())
    }

    // Execution requests

    pub async fn submit_request(&self, host_id: &str, request: &ExecutionRequest) -> Result<()> {
        self.put_json(&paths::request(host_id, &request.request_id), request).await
    }

    pub async fn get_request(
        &self,
        host_id: &str,
        request_id: &str,
    ) -> Result<Option<ExecutionRequest>> {
        self.get_json(&paths::request(host_id, request_id)).await
    }

    /// Rewrite the request record with `processed = true`.
    pub async fn mark_processed(&self, host_id: &str, request: &ExecutionRequest) -> Result<()> {
        let processed = ExecutionRequest {
            processed: true,
            ..request.clone()
        };
        self.submit_request(host_id, &processed).await
    }

    pub async fn watch_requests(&self, host_id: &str) -> Result<Subscription> {
        self.store.watch(&paths::request_root(host_id)).await
    }

    // Client status

    pub async fn put_client_status(
        &self,
        client_id: &str,
        record: &ClientStatusRecord,
    ) -> Result<()> {
        self.put_json(&paths::client(client_id), record).await
    }

    pub async fn client_status(&self, client_id: &str) -> Result<Option<ClientStatusRecord>> {
        self.get_json(&paths::client(client_id)).await
    }

    pub async fn watch_client(&self, client_id: &str) -> Result<Subscription> {
        self.store.watch(&paths::client(client_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobStatus;
    use crate::store::MemoryStore;

    fn state() -> SharedState {
        SharedState::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn path_layout() {
        assert_eq!(paths::resources("h1"), "resources/h1");
        assert_eq!(paths::request_root("h1"), "executionRequests/h1");
        assert_eq!(paths::request("h1", "r1"), "executionRequests/h1/r1");
        assert_eq!(paths::ledger("r1"), "processedRequests/r1");
        assert_eq!(paths::client("c1"), "clients/c1");
    }

    #[tokio::test]
    async fn mark_processed_keeps_other_fields() {
        let state = state();
        let request = ExecutionRequest::new("r1", "c1", "print(1)");
        state.submit_request("h1", &request).await.unwrap();
        state.mark_processed("h1", &request).await.unwrap();

        let stored = state.get_request("h1", "r1").await.unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.code.as_deref(), Some("print(1)"));
        assert_eq!(stored.client_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn client_status_round_trip() {
        let state = state();
        assert!(state.client_status("c1").await.unwrap().is_none());

        state
            .put_client_status("c1", &ClientStatusRecord::running("r1"))
            .await
            .unwrap();
        let status = state.client_status("c1").await.unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Running);
        assert_eq!(status.request_id, "r1");
    }

    #[tokio::test]
    async fn list_resources_skips_garbage() {
        let state = state();
        state
            .store()
            .put("resources/bad", serde_json::json!({"nope": true}))
            .await
            .unwrap();
        let record = HostResourceRecord {
            host_id: "good".to_string(),
            cpu_count: 2,
            ram_bytes: 1,
            gpu_list: Vec::new(),
            observed_at: chrono::Utc::now(),
        };
        state.publish_resources(&record).await.unwrap();

        let hosts = state.list_resources().await.unwrap();
        assert_eq!(hosts, vec![record]);
    }
}
