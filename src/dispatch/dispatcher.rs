use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::ledger::{Claim, ProcessedRequestLedger};
use super::request::{ClientStatusRecord, ExecutionRequest};
use crate::error::Result;
use crate::sandbox::SandboxExecutor;
use crate::store::{SharedState, StoreUpdate, Subscription};

/// Pause between attempts to re-establish a lost request subscription.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Why a delivered record was not treated as a claimable job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Absent,
    Malformed,
    AlreadyProcessed,
    MissingCode,
    MissingClient,
}

/// What handling one delivery amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Discarded(DiscardReason),
    /// Already claimed, by this host or another.
    Duplicate,
    Completed,
    Failed,
}

/// A delivered request that passed validation.
#[derive(Debug, Clone)]
struct ValidRequest {
    request: ExecutionRequest,
    client_id: String,
    code: String,
}

/// Watches this host's request path and runs each request at most once.
///
/// Per request id the lifecycle is `Unseen -> Claimed -> Running ->
/// Completed | Error`:
///
/// 1. Records that are absent, already processed, or missing `code` or
///    `clientId` are discarded without any write
/// 2. The ledger is checked and, if unclaimed, the claim is written
/// 3. `running` is published to `clients/{clientId}`
/// 4. The code runs in the sandbox with the request's hints or the defaults
/// 5. `completed` with the output, or `error` with the failure message, is
///    published and nothing more is written for that request
///
/// The store delivers at-least-once, so every step tolerates replays.
pub struct RequestDispatcher {
    host_id: String,
    state: SharedState,
    executor: SandboxExecutor,
    ledger: ProcessedRequestLedger,
    resubscribe_delay: Duration,
}

impl RequestDispatcher {
    pub fn new(host_id: impl Into<String>, state: SharedState, executor: SandboxExecutor) -> Self {
        Self {
            host_id: host_id.into(),
            ledger: ProcessedRequestLedger::new(state.clone()),
            state,
            executor,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn ledger(&self) -> &ProcessedRequestLedger {
        &self.ledger
    }

    /// Handle deliveries until `shutdown` is cancelled, then wait for every
    /// in-flight execution to finish.
    ///
    /// Each delivery is handled on its own task so a long execution never
    /// holds up deliveries for other requests. A subscription that ends is
    /// re-established after `resubscribe_delay`; its snapshot is redelivered
    /// and the ledger absorbs the duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error only if the first subscription cannot be opened.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut subscription = self.state.watch_requests(&self.host_id).await?;
        let mut in_flight = JoinSet::new();

        tracing::info!(host_id = %self.host_id, "Listening for execution requests");

        loop {
            tokio::select! {
                update = subscription.next() => {
                    let Some(update) = update else {
                        tracing::warn!(
                            host_id = %self.host_id,
                            "Request subscription closed, resubscribing"
                        );
                        match self.resubscribe(&shutdown).await {
                            Some(fresh) => {
                                subscription = fresh;
                                continue;
                            }
                            None => break,
                        }
                    };
                    let dispatcher = self.clone();
                    in_flight.spawn(async move {
                        dispatcher.handle_update(update).await;
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Request handler panicked");
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!(in_flight = in_flight.len(), "Draining in-flight executions");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Request handler panicked");
            }
        }

        tracing::info!(host_id = %self.host_id, "Request dispatcher stopped");
        Ok(())
    }

    /// Retry `watch_requests` until it succeeds. `None` once `shutdown` fires.
    async fn resubscribe(&self, shutdown: &CancellationToken) -> Option<Subscription> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
                _ = shutdown.cancelled() => return None,
            }

            match self.state.watch_requests(&self.host_id).await {
                Ok(subscription) => {
                    tracing::info!(host_id = %self.host_id, "Request subscription re-established");
                    return Some(subscription);
                }
                Err(e) => {
                    tracing::warn!(
                        host_id = %self.host_id,
                        error = %e,
                        "Failed to resubscribe to requests"
                    );
                }
            }
        }
    }

    async fn handle_update(&self, update: StoreUpdate) {
        let request_id = update.key().to_string();
        match self.handle_delivery(&request_id, update.value).await {
            Ok(outcome) => {
                tracing::debug!(request_id = %request_id, ?outcome, "Delivery handled");
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Failed to claim request");
            }
        }
    }

    /// Process one delivery of the record stored under `request_id`.
    ///
    /// Returns an error only when the claim could not be written, in which
    /// case nothing was executed and a later delivery may try again.
    pub async fn handle_delivery(&self, request_id: &str, value: Value) -> Result<DispatchOutcome> {
        let valid = match Self::validate(request_id, value) {
            Ok(valid) => valid,
            Err(reason) => {
                tracing::debug!(request_id, ?reason, "Discarding delivery");
                return Ok(DispatchOutcome::Discarded(reason));
            }
        };

        if self.ledger.try_claim(&self.host_id, &valid.request).await? == Claim::Duplicate {
            tracing::debug!(request_id, "Duplicate delivery of claimed request");
            return Ok(DispatchOutcome::Duplicate);
        }

        let limits = valid.request.limits(self.executor.default_limits());
        tracing::info!(
            request_id,
            client_id = %valid.client_id,
            cpu_count = limits.cpu_count,
            ram_bytes = limits.ram_bytes,
            "Claimed execution request"
        );

        self.publish_status(&valid.client_id, ClientStatusRecord::running(request_id))
            .await;

        let result = self.executor.execute(&valid.code, limits).await;

        let (record, outcome) = match result.error {
            None => (
                ClientStatusRecord::completed(request_id, result.output),
                DispatchOutcome::Completed,
            ),
            Some(message) => (
                ClientStatusRecord::error(request_id, message),
                DispatchOutcome::Failed,
            ),
        };

        tracing::info!(request_id, status = %record.status, "Execution request finished");
        self.publish_status(&valid.client_id, record).await;

        Ok(outcome)
    }

    fn validate(
        request_id: &str,
        value: Value,
    ) -> std::result::Result<ValidRequest, DiscardReason> {
        if value.is_null() {
            return Err(DiscardReason::Absent);
        }

        let mut request: ExecutionRequest =
            serde_json::from_value(value).map_err(|_| DiscardReason::Malformed)?;

        if request.processed {
            return Err(DiscardReason::AlreadyProcessed);
        }

        let code = request
            .code
            .clone()
            .filter(|code| !code.is_empty())
            .ok_or(DiscardReason::MissingCode)?;
        let client_id = request
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(DiscardReason::MissingClient)?;

        // The store key is the identity of the request
        request.request_id = request_id.to_string();

        Ok(ValidRequest {
            request,
            client_id,
            code,
        })
    }

    /// Write `record` unless it would move this request's status backwards.
    /// Write failures are logged; the client simply sees no update.
    async fn publish_status(&self, client_id: &str, record: ClientStatusRecord) {
        match self.state.client_status(client_id).await {
            Ok(Some(current))
                if current.request_id == record.request_id
                    && !current.status.can_transition_to(record.status) =>
            {
                tracing::warn!(
                    client_id,
                    request_id = %record.request_id,
                    current = %current.status,
                    next = %record.status,
                    "Refusing to move client status backwards"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(client_id, error = %e, "Could not read current client status");
            }
        }

        if let Err(e) = self.state.put_client_status(client_id, &record).await {
            tracing::error!(
                client_id,
                request_id = %record.request_id,
                status = %record.status,
                error = %e,
                "Failed to publish client status"
            );
        }
    }
}
