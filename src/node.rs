use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{HostConfig, StoreConfig};
use crate::dispatch::RequestDispatcher;
use crate::error::Result;
use crate::http::{run_http, HttpState};
use crate::resources::{ResourceAdvertiser, ResourceSampler};
use crate::sandbox::SandboxExecutor;
use crate::store::{MemoryStore, RedisStore, SharedState, StateStore};

/// Open the store backend named by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Redis { url, prefix } => Ok(Arc::new(RedisStore::connect(url, prefix).await?)),
    }
}

/// One host process: advertiser, dispatcher and optional HTTP endpoint.
pub struct HostNode {
    pub config: HostConfig,
    pub state: SharedState,
    pub executor: SandboxExecutor,
    sampler: ResourceSampler,
}

impl HostNode {
    /// Build a node with the configured store and the docker sandbox.
    pub async fn connect(config: HostConfig) -> Result<Self> {
        let store = open_store(&config.store).await?;
        let executor = SandboxExecutor::docker(config.sandbox.clone());
        Ok(Self::with_parts(config, store, executor))
    }

    pub fn with_parts(
        config: HostConfig,
        store: Arc<dyn StateStore>,
        executor: SandboxExecutor,
    ) -> Self {
        Self {
            config,
            state: SharedState::new(store),
            executor,
            sampler: ResourceSampler::new(),
        }
    }

    pub fn with_sampler(mut self, sampler: ResourceSampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Run every subsystem until `shutdown` is cancelled.
    ///
    /// 1. Spawns the resource advertiser
    /// 2. Spawns the HTTP endpoint, if an address is configured
    /// 3. Runs the request dispatcher, which drains in-flight jobs on shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatcher cannot subscribe to the store.
    /// The other subsystems log their own errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let host_id = self.config.host_id.clone();
        tracing::info!(host_id = %host_id, "Starting host node");

        let advertiser = ResourceAdvertiser::new(
            host_id.clone(),
            self.config.advertise_interval,
            self.sampler,
            self.state.clone(),
        );
        let advertiser_shutdown = shutdown.clone();
        let advertiser_handle = tokio::spawn(async move {
            advertiser.run(advertiser_shutdown).await;
        });

        let http_handle = self.config.http_addr.map(|addr| {
            let http_state = HttpState {
                executor: self.executor.clone(),
                state: self.state.clone(),
                limits: self.config.http_limits,
                host_ttl: self.config.advertise_interval * 3,
            };
            let http_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_http(addr, http_state, http_shutdown).await;
            })
        });

        let dispatcher = Arc::new(RequestDispatcher::new(
            host_id.clone(),
            self.state.clone(),
            self.executor.clone(),
        ));
        let result = dispatcher.run(shutdown.clone()).await;

        // The dispatcher only returns early on error; stop the rest too
        shutdown.cancel();
        let _ = advertiser_handle.await;
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }

        tracing::info!(host_id = %host_id, "Host node stopped");
        result
    }
}
