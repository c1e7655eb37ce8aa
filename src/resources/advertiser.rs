use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{HostResourceRecord, ResourceSampler};
use crate::error::Result;
use crate::store::SharedState;

/// Publishes this host's capacity at `resources/{hostId}` on a fixed interval.
///
/// A failed write is logged and the next tick serves as the retry.
pub struct ResourceAdvertiser {
    host_id: String,
    interval: Duration,
    sampler: ResourceSampler,
    state: SharedState,
}

impl ResourceAdvertiser {
    pub fn new(
        host_id: impl Into<String>,
        interval: Duration,
        sampler: ResourceSampler,
        state: SharedState,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            interval,
            sampler,
            state,
        }
    }

    /// Sample once and write the record.
    pub async fn advertise_once(&self) -> Result<HostResourceRecord> {
        let sample = self.sampler.sample().await;
        let record = HostResourceRecord::from_sample(&self.host_id, sample);
        self.state.publish_resources(&record).await?;
        Ok(record)
    }

    /// Advertise every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    tracing::info!(host_id = %self.host_id, "Resource advertiser stopped");
                    break;
                }
            }

            match self.advertise_once().await {
                Ok(record) => tracing::debug!(
                    host_id = %self.host_id,
                    cpu_count = record.cpu_count,
                    ram_bytes = record.ram_bytes,
                    gpus = record.gpu_list.len(),
                    "Advertised resources"
                ),
                Err(e) => tracing::error!(
                    host_id = %self.host_id,
                    error = %e,
                    "Failed to advertise resources"
                ),
            }
        }
    }
}
