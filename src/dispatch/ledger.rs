use std::collections::{HashSet, VecDeque};

use serde_json::Value;
use tokio::sync::Mutex;

use super::request::ExecutionRequest;
use crate::error::Result;
use crate::store::{paths, SharedState};

/// Result of [`ProcessedRequestLedger::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This call claimed the request; the caller must execute it.
    Claimed,
    /// Someone already claimed it.
    Duplicate,
}

/// Local claims kept in memory before the oldest are forgotten.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Most recently claimed ids, oldest evicted first.
#[derive(Debug)]
struct RecentClaims {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentClaims {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, request_id: &str) -> bool {
        self.ids.contains(request_id)
    }

    fn insert(&mut self, request_id: &str) {
        if !self.ids.insert(request_id.to_string()) {
            return;
        }
        self.order.push_back(request_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Set of claimed request ids, stored at `processedRequests/{requestId}`.
///
/// Check-and-claim is serialized per host behind one lock, and the host also
/// remembers its recent claims locally, so concurrent deliveries inside one
/// process can never both claim. The local cache is bounded; an evicted id is
/// still found through its store entry. Across hosts the store offers no
/// compare-and-swap: two hosts reading stale replicas can still race, which
/// placement by host identity keeps rare.
pub struct ProcessedRequestLedger {
    state: SharedState,
    claimed: Mutex<RecentClaims>,
}

impl ProcessedRequestLedger {
    pub fn new(state: SharedState) -> Self {
        Self::with_capacity(state, DEFAULT_CACHE_CAPACITY)
    }

    /// Ledger remembering at most `capacity` claims locally.
    pub fn with_capacity(state: SharedState, capacity: usize) -> Self {
        Self {
            state,
            claimed: Mutex::new(RecentClaims::new(capacity)),
        }
    }

    /// Whether `request_id` has been claimed by this or any other process.
    pub async fn contains(&self, request_id: &str) -> Result<bool> {
        if self.claimed.lock().await.contains(request_id) {
            return Ok(true);
        }
        self.in_store(request_id).await
    }

    /// Number of claims remembered locally.
    pub async fn cached(&self) -> usize {
        self.claimed.lock().await.len()
    }

    async fn in_store(&self, request_id: &str) -> Result<bool> {
        let entry = self.state.store().get(&paths::ledger(request_id)).await?;
        Ok(matches!(entry, Some(value) if value != Value::Bool(false)))
    }

    /// Claim `request` for execution on `host_id`.
    ///
    /// The ledger entry is written first and is the authority: if it cannot
    /// be written the claim fails and nothing may run. The `processed` flag on
    /// the request record is written second and a failure there is only
    /// logged.
    pub async fn try_claim(&self, host_id: &str, request: &ExecutionRequest) -> Result<Claim> {
        let mut claimed = self.claimed.lock().await;
        let request_id = request.request_id.as_str();

        if claimed.contains(request_id) {
            return Ok(Claim::Duplicate);
        }

        if self.in_store(request_id).await? {
            claimed.insert(request_id);
            return Ok(Claim::Duplicate);
        }

        self.state
            .store()
            .put(&paths::ledger(request_id), Value::Bool(true))
            .await?;
        claimed.insert(request_id);

        if let Err(e) = self.state.mark_processed(host_id, request).await {
            tracing::error!(request_id, error = %e, "Failed to mark request processed");
        }

        Ok(Claim::Claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StateStore};
    use std::sync::Arc;

    fn ledger() -> (Arc<MemoryStore>, ProcessedRequestLedger) {
        let store = Arc::new(MemoryStore::recording());
        let ledger = ProcessedRequestLedger::new(SharedState::new(store.clone()));
        (store, ledger)
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let (store, ledger) = ledger();
        let request = ExecutionRequest::new("r1", "c1", "x");

        assert!(!ledger.contains("r1").await.unwrap());
        assert_eq!(ledger.try_claim("h", &request).await.unwrap(), Claim::Claimed);
        assert_eq!(ledger.try_claim("h", &request).await.unwrap(), Claim::Duplicate);
        assert!(ledger.contains("r1").await.unwrap());

        let paths: Vec<String> = store.writes().await.into_iter().map(|w| w.path).collect();
        assert_eq!(paths, vec!["processedRequests/r1", "executionRequests/h/r1"]);
    }

    #[tokio::test]
    async fn entry_written_by_another_process_is_honoured() {
        let (store, ledger) = ledger();
        store.put("processedRequests/r2", Value::Bool(true)).await.unwrap();

        let request = ExecutionRequest::new("r2", "c1", "x");
        assert_eq!(ledger.try_claim("h", &request).await.unwrap(), Claim::Duplicate);
    }

    #[tokio::test]
    async fn false_entry_counts_as_unclaimed() {
        let (store, ledger) = ledger();
        store.put("processedRequests/r3", Value::Bool(false)).await.unwrap();
        assert!(!ledger.contains("r3").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one() {
        let (_store, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let request = ExecutionRequest::new("r4", "c1", "x");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                ledger.try_claim("h", &request).await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == Claim::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn local_cache_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ProcessedRequestLedger::with_capacity(SharedState::new(store), 2);

        for id in ["a", "b", "c", "d"] {
            let request = ExecutionRequest::new(id, "c1", "x");
            assert_eq!(ledger.try_claim("h", &request).await.unwrap(), Claim::Claimed);
        }
        assert_eq!(ledger.cached().await, 2);

        // Evicted locally, still claimed in the store
        let evicted = ExecutionRequest::new("a", "c1", "x");
        assert_eq!(ledger.try_claim("h", &evicted).await.unwrap(), Claim::Duplicate);
        assert!(ledger.contains("a").await.unwrap());
    }

    #[test]
    fn recent_claims_evict_oldest_first() {
        let mut recent = RecentClaims::new(2);
        recent.insert("a");
        recent.insert("b");
        recent.insert("b");
        assert_eq!(recent.len(), 2);

        recent.insert("c");
        assert!(!recent.contains("a"));
        assert!(recent.contains("b"));
        assert!(recent.contains("c"));
    }
}
