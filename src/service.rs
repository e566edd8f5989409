//! Service lifecycle: owns the store, the chain client and the single sync task.
//!
//! Control operations never return errors. `start` and `stop` report a boolean and log
//! the diagnostic, and both are idempotent.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::etl::engine::{SyncEngine, SyncEngineConfig, SyncStatus};
use crate::etl::engine_db::EngineDb;
use crate::etl::extractor::{ChainClient, StarknetChainClient};
use crate::etl::registry::{EventFilter, HandlerRegistry};
use crate::etl::store::{IndexedData, RecordSchema, RecordStore, StoredRecord};

struct Components {
    chain: Arc<dyn ChainClient>,
    store: RecordStore,
    engine_db: EngineDb,
}

struct Running {
    handle: JoinHandle<()>,
    shutdown_token: CancellationToken,
}

/// An indexer instance with explicit lifecycle.
///
/// Filters are registered before [`IndexerService::start`]. The registry is frozen into
/// the sync task at start, so later registrations take effect on the next start.
pub struct IndexerService {
    config: IndexerConfig,
    components: Result<Components, IndexerError>,
    registry: HandlerRegistry,
    registration_error: Option<String>,
    status: Arc<watch::Sender<SyncStatus>>,
    running: Option<Running>,
    last_stop: bool,
}

impl IndexerService {
    /// Opens the store at `config.store_location` and connects to `config.chain_endpoint`.
    ///
    /// Construction itself never fails: an initialization error is kept and reported by
    /// [`IndexerService::start`].
    pub async fn new(config: IndexerConfig) -> Self {
        let chain: Arc<dyn ChainClient> = Arc::new(StarknetChainClient::new(
            config.chain_endpoint.clone(),
            config.rpc_retry.clone(),
        ));
        Self::with_chain_client(config, chain).await
    }

    /// Like [`IndexerService::new`], with a caller-provided chain client.
    pub async fn with_chain_client(config: IndexerConfig, chain: Arc<dyn ChainClient>) -> Self {
        let store = RecordStore::open(&config.store_location).await;
        Self::assemble(config, chain, store).await
    }

    /// Builds the service over an already opened store.
    pub async fn from_parts(config: IndexerConfig, chain: Arc<dyn ChainClient>, store: RecordStore) -> Self {
        Self::assemble(config, chain, Ok(store)).await
    }

    async fn assemble(
        config: IndexerConfig,
        chain: Arc<dyn ChainClient>,
        store: Result<RecordStore, IndexerError>,
    ) -> Self {
        let components = match store {
            Ok(store) => match EngineDb::new(store.pool().clone()).await {
                Ok(engine_db) => Ok(Components {
                    chain,
                    store,
                    engine_db,
                }),
                Err(e) => Err(IndexerError::Initialization(format!(
                    "failed to initialize engine database: {e:#}"
                ))),
            },
            Err(e) => Err(e),
        };

        match &components {
            Ok(c) => tracing::info!(
                target: "auco::service",
                network = %config.network,
                chain = c.chain.name(),
                store = %config.store_location.display(),
                "Indexer service constructed"
            ),
            Err(e) => tracing::error!(
                target: "auco::service",
                error = %e,
                "Indexer service could not be initialized, it will not start"
            ),
        }

        let (status, _) = watch::channel(SyncStatus::default());
        let last_stop = components.is_ok();
        Self {
            config,
            components,
            registry: HandlerRegistry::new(),
            registration_error: None,
            status: Arc::new(status),
            running: None,
            last_stop,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// The initialization error, if construction failed.
    pub fn init_error(&self) -> Option<&IndexerError> {
        self.components.as_ref().err()
    }

    /// The record store, for handlers to write through.
    pub fn store(&self) -> Option<&RecordStore> {
        self.components.as_ref().ok().map(|c| &c.store)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Registers a filter.
    ///
    /// A rejected registration is a configuration error. It is returned here and also
    /// keeps the service from starting.
    pub fn register(&mut self, filter: EventFilter) -> Result<(), IndexerError> {
        self.registry.register(filter).inspect_err(|e| {
            tracing::error!(target: "auco::service", error = %e, "Filter registration rejected");
            self.registration_error = Some(e.to_string());
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Receiver of status snapshots. Stays valid across restarts.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Initializes the sync engine and spawns the sync loop.
    ///
    /// Returns `false`, with nothing scheduled, if the service could not be initialized,
    /// a registration was rejected, or the cursor could not be loaded. Returns `true`
    /// without side effects if already running.
    pub async fn start(&mut self) -> bool {
        if self.is_running() {
            tracing::debug!(target: "auco::service", "Start requested while running, ignoring");
            return true;
        }
        // A loop that finished on its own (stop block reached) is reaped and restarted.
        self.running = None;

        if let Some(reason) = &self.registration_error {
            tracing::error!(target: "auco::service", reason = %reason, "Refusing to start with invalid filters");
            return false;
        }

        let components = match &self.components {
            Ok(components) => components,
            Err(e) => {
                tracing::error!(target: "auco::service", error = %e, "Refusing to start, service was never initialized");
                return false;
            }
        };

        if self.registry.is_empty() {
            tracing::warn!(target: "auco::service", "No filters registered, sync loop will only advance the cursor");
        }

        let engine = Arc::new(
            SyncEngine::new(
                components.chain.clone(),
                Arc::new(self.registry.clone()),
                components.engine_db.clone(),
                SyncEngineConfig::from(&self.config),
            )
            .with_status_channel(self.status.clone()),
        );

        let next_block = match engine.initialize().await {
            Ok(next_block) => next_block,
            Err(e) => {
                tracing::error!(target: "auco::service", error = %e, "Failed to start sync engine");
                return false;
            }
        };

        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown_token = shutdown_token.clone();
            async move { engine.run(next_block, shutdown_token).await }
        });

        self.running = Some(Running {
            handle,
            shutdown_token,
        });

        tracing::info!(target: "auco::service", next_block, "Indexer started");
        true
    }

    /// Requests the sync loop to stop and waits for it, up to `shutdown_timeout`.
    ///
    /// The in-flight block, if any, finishes first. On timeout the task is aborted,
    /// which releases the chain client, and `false` is returned. Without a running
    /// loop this returns the outcome of the previous stop.
    pub async fn stop(&mut self) -> bool {
        let Some(mut running) = self.running.take() else {
            return self.last_stop;
        };

        tracing::info!(target: "auco::service", "Stopping indexer, waiting for the in-flight block");
        running.shutdown_token.cancel();

        let timeout = self.config.shutdown_timeout;
        let stopped = match tokio::time::timeout(timeout, &mut running.handle).await {
            Ok(Ok(())) => {
                tracing::info!(target: "auco::service", "Sync loop stopped");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(target: "auco::service", error = %e, "Sync loop panicked");
                false
            }
            Err(_) => {
                tracing::warn!(
                    target: "auco::service",
                    "Sync loop did not stop within {:?}, aborting it",
                    timeout
                );
                running.handle.abort();
                false
            }
        };

        self.last_stop = stopped;
        stopped
    }

    /// Stops the loop, then closes the store.
    pub async fn shutdown(mut self) -> bool {
        let stopped = self.stop().await;
        if let Ok(components) = &self.components {
            components.store.close().await;
        }
        stopped
    }

    /// Every committed record of `schema`, ordered by id.
    pub async fn get_indexed_data(
        &self,
        schema: &RecordSchema,
    ) -> Result<IndexedData<StoredRecord>, IndexerError> {
        match &self.components {
            Ok(components) => components.store.indexed_data(schema).await,
            Err(e) => Err(IndexerError::Initialization(e.to_string())),
        }
    }
}

impl Drop for IndexerService {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown_token.cancel();
        }
    }
}
