//! Indexer configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::error::IndexerError;
use crate::etl::extractor::RetryPolicy;

pub const DEFAULT_CHAIN_ENDPOINT: &str = "http://127.0.0.1:5050";
pub const DEFAULT_STORE_LOCATION: &str = "./indexer.db";
pub const DEFAULT_NETWORK: &str = "devnet";

/// Where a fresh indexer (one without a persisted cursor) begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartingBlock {
    Number(u64),
    /// The chain head at initialization. History is ignored.
    Latest,
}

impl Default for StartingBlock {
    fn default() -> Self {
        Self::Number(0)
    }
}

impl FromStr for StartingBlock {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        s.parse::<u64>().map(Self::Number).map_err(|_| {
            IndexerError::Initialization(format!(
                "invalid starting block {s:?}: expected \"latest\" or a block number"
            ))
        })
    }
}

impl fmt::Display for StartingBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Latest => f.write_str("latest"),
        }
    }
}

/// Configuration consumed by [`crate::service::IndexerService`].
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub chain_endpoint: Url,

    /// Ignored once a cursor has been persisted.
    pub starting_block: StartingBlock,

    /// SQLite file holding both records and the sync cursor.
    pub store_location: PathBuf,

    /// Network identifier, also the default cursor key.
    pub network: String,

    /// Cursor key. Defaults to `network`.
    pub indexer_id: String,

    /// Delay between head polls while caught up.
    pub poll_interval: Duration,

    /// First delay before retrying a failed block.
    pub retry_backoff: Duration,

    pub max_retry_backoff: Duration,

    /// Upper bound on how long `stop()` waits for the in-flight block.
    pub shutdown_timeout: Duration,

    /// Per-request retries of the chain client.
    pub rpc_retry: RetryPolicy,

    /// Stop syncing once this block is committed.
    pub stop_at: Option<u64>,
}

impl IndexerConfig {
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    /// Block-level retry schedule. Never gives up.
    pub fn block_backoff(&self) -> RetryPolicy {
        RetryPolicy::new(u32::MAX, self.retry_backoff, self.max_retry_backoff, 2.0)
    }
}

/// Builder for IndexerConfig.
#[derive(Debug, Default)]
pub struct IndexerConfigBuilder {
    chain_endpoint: Option<String>,
    starting_block: Option<StartingBlock>,
    store_location: Option<PathBuf>,
    network: Option<String>,
    indexer_id: Option<String>,
    poll_interval: Option<Duration>,
    retry_backoff: Option<Duration>,
    max_retry_backoff: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    rpc_retry: Option<RetryPolicy>,
    stop_at: Option<u64>,
}

impl IndexerConfigBuilder {
    pub fn chain_endpoint(mut self, url: impl Into<String>) -> Self {
        self.chain_endpoint = Some(url.into());
        self
    }

    pub fn starting_block(mut self, starting_block: StartingBlock) -> Self {
        self.starting_block = Some(starting_block);
        self
    }

    pub fn store_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_location = Some(path.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Overrides the cursor key, for several indexers sharing one store.
    pub fn indexer_id(mut self, id: impl Into<String>) -> Self {
        self.indexer_id = Some(id.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = Some(initial);
        self.max_retry_backoff = Some(max);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn rpc_retry(mut self, policy: RetryPolicy) -> Self {
        self.rpc_retry = Some(policy);
        self
    }

    pub fn stop_at(mut self, block_number: u64) -> Self {
        self.stop_at = Some(block_number);
        self
    }

    /// Builds the configuration, validating the chain endpoint.
    pub fn build(self) -> Result<IndexerConfig, IndexerError> {
        let raw = self.chain_endpoint.as_deref().unwrap_or(DEFAULT_CHAIN_ENDPOINT);
        let chain_endpoint = Url::parse(raw).map_err(|e| {
            IndexerError::Initialization(format!("invalid chain endpoint {raw:?}: {e}"))
        })?;

        let network = self.network.unwrap_or_else(|| DEFAULT_NETWORK.to_string());
        Ok(IndexerConfig {
            chain_endpoint,
            starting_block: self.starting_block.unwrap_or_default(),
            store_location: self
                .store_location
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_LOCATION)),
            indexer_id: self.indexer_id.unwrap_or_else(|| network.clone()),
            network,
            poll_interval: self.poll_interval.unwrap_or(Duration::from_secs(3)),
            retry_backoff: self.retry_backoff.unwrap_or(Duration::from_secs(1)),
            max_retry_backoff: self.max_retry_backoff.unwrap_or(Duration::from_secs(60)),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(Duration::from_secs(30)),
            rpc_retry: self.rpc_retry.unwrap_or_default(),
            stop_at: self.stop_at,
        })
    }
}
