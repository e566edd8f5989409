//! Sync engine: walks the chain block by block and drives handlers.
//!
//! One loop per indexer. For each block the engine fetches the logs, decodes every log
//! against the filters registered for its contract, awaits each matching handler in
//! registration order and only then commits the cursor. Any handler or commit failure
//! aborts the block, which is retried from its first event after a backoff, so delivery
//! is at-least-once and no block is ever skipped.
//!
//! Cancellation is cooperative: it is observed between blocks and while the loop is
//! parked (fetching, polling or backing off), never while handlers run.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{IndexerConfig, StartingBlock};
use crate::error::IndexerError;
use crate::etl::decoder::{self, DecodedEvent, RawLog};
use crate::etl::engine_db::EngineDb;
use crate::etl::extractor::{ChainClient, RetryPolicy};
use crate::etl::registry::HandlerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Initializing,
    Syncing,
    /// Caught up with the head, polling for the next block.
    Waiting,
    Stopping,
}

/// Snapshot of engine progress, published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Last fully committed block.
    pub cursor: Option<u64>,
    pub next_block: Option<u64>,
    /// Latest chain head observed.
    pub head: Option<u64>,
    /// Blocks committed since the status channel was created.
    pub blocks_processed: u64,
    pub events_handled: u64,
    /// Undecodable logs in committed blocks. Failed attempts are not counted.
    pub decode_errors: u64,
    /// Failed attempts at the current block. Reset by a commit.
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Cursor key in the engine database.
    pub indexer_id: String,
    pub starting_block: StartingBlock,
    pub poll_interval: Duration,
    /// Delay schedule between attempts at a failing block.
    pub block_backoff: RetryPolicy,
    /// Finish once this block is committed.
    pub stop_at: Option<u64>,
}

impl From<&IndexerConfig> for SyncEngineConfig {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            indexer_id: config.indexer_id.clone(),
            starting_block: config.starting_block,
            poll_interval: config.poll_interval,
            block_backoff: config.block_backoff(),
            stop_at: config.stop_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Committed { block_number: u64, events_handled: u64 },
    /// The block does not exist on the chain yet.
    NotAvailable,
}

pub struct SyncEngine {
    chain: Arc<dyn ChainClient>,
    registry: Arc<HandlerRegistry>,
    engine_db: EngineDb,
    config: SyncEngineConfig,
    status: Arc<watch::Sender<SyncStatus>>,
}

impl SyncEngine {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        registry: Arc<HandlerRegistry>,
        engine_db: EngineDb,
        config: SyncEngineConfig,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            chain,
            registry,
            engine_db,
            config,
            status: Arc::new(status),
        }
    }

    /// Publishes into `status` instead of a private channel, so receivers can outlive
    /// the engine and span restarts.
    pub fn with_status_channel(mut self, status: Arc<watch::Sender<SyncStatus>>) -> Self {
        self.status = status;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    fn publish(&self, update: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(update);
    }

    /// Loads the cursor and returns the first block to process.
    ///
    /// A persisted cursor always wins over the configured starting block.
    pub async fn initialize(&self) -> Result<u64, IndexerError> {
        self.publish(|s| s.state = SyncState::Initializing);

        match self.resolve_start().await {
            Ok((cursor, next_block)) => {
                tracing::info!(
                    target: "auco::etl::engine",
                    indexer = %self.config.indexer_id,
                    chain = self.chain.name(),
                    cursor = ?cursor,
                    next_block,
                    filters = self.registry.len(),
                    "Sync engine initialized"
                );
                self.publish(|s| {
                    s.cursor = cursor;
                    s.next_block = Some(next_block);
                });
                Ok(next_block)
            }
            Err(e) => {
                tracing::error!(target: "auco::etl::engine", error = %e, "Sync engine initialization failed");
                self.publish(|s| {
                    s.state = SyncState::Idle;
                    s.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    async fn resolve_start(&self) -> Result<(Option<u64>, u64), IndexerError> {
        let cursor = self
            .engine_db
            .get_cursor(&self.config.indexer_id)
            .await
            .map_err(IndexerError::Cursor)?;

        let next_block = match (cursor, self.config.starting_block) {
            (Some(cursor), _) => cursor + 1,
            (None, StartingBlock::Number(n)) => n,
            (None, StartingBlock::Latest) => {
                let head = self.chain.block_number().await.map_err(IndexerError::Chain)?;
                self.publish(|s| s.head = Some(head));
                head
            }
        };

        if let Err(e) = self
            .engine_db
            .set_stat("start_time", &chrono::Utc::now().timestamp().to_string())
            .await
        {
            tracing::warn!(target: "auco::etl::engine", error = %e, "Failed to record start time");
        }

        Ok((cursor, next_block))
    }

    /// Runs the sync loop from `next_block` until cancelled or `stop_at` is committed.
    pub async fn run(&self, mut next_block: u64, shutdown: CancellationToken) {
        let mut head = self.status.borrow().head;
        let mut failures: u32 = 0;

        tracing::info!(target: "auco::etl::engine", next_block, "Starting sync loop");

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(target: "auco::etl::engine", "Shutdown requested, stopping sync loop");
                break;
            }

            if self.config.stop_at.is_some_and(|stop_at| next_block > stop_at) {
                tracing::info!(target: "auco::etl::engine", next_block, "Reached stop block, stopping sync loop");
                break;
            }

            self.publish(|s| {
                s.state = SyncState::Syncing;
                s.next_block = Some(next_block);
            });

            // Only ask for the head again once the cached one is exhausted.
            if head.map_or(true, |h| next_block > h) {
                let fetched = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    fetched = self.chain.block_number() => fetched,
                };
                match fetched {
                    Ok(latest) => {
                        head = Some(latest);
                        self.publish(|s| s.head = Some(latest));
                    }
                    Err(e) => {
                        failures += 1;
                        if !self.back_off(failures, IndexerError::Chain(e), &shutdown).await {
                            break;
                        }
                        continue;
                    }
                }

                if head.map_or(true, |h| next_block > h) {
                    if !self.wait_for_block(next_block, &shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                fetched = self.chain.block_logs(next_block) => fetched,
            };

            let logs = match fetched {
                Ok(Some(logs)) => logs,
                Ok(None) => {
                    // Head moved backwards or the node lags behind its own head.
                    head = None;
                    if !self.wait_for_block(next_block, &shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    failures += 1;
                    if !self.back_off(failures, IndexerError::Chain(e), &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.process_block(next_block, logs).await {
                Ok(_) => {
                    failures = 0;
                    next_block += 1;
                }
                Err(e) => {
                    failures += 1;
                    if !self.back_off(failures, e, &shutdown).await {
                        break;
                    }
                }
            }
        }

        self.publish(|s| s.state = SyncState::Stopping);
        tracing::info!(target: "auco::etl::engine", "Sync loop completed gracefully");
        self.publish(|s| s.state = SyncState::Idle);
    }

    /// Fetches and processes a single block, without retries.
    pub async fn sync_block(&self, block_number: u64) -> Result<BlockOutcome, IndexerError> {
        let Some(logs) = self
            .chain
            .block_logs(block_number)
            .await
            .map_err(IndexerError::Chain)?
        else {
            return Ok(BlockOutcome::NotAvailable);
        };

        let events_handled = self.process_block(block_number, logs).await?;
        Ok(BlockOutcome::Committed {
            block_number,
            events_handled,
        })
    }

    /// Dispatches every event of the block, then commits the cursor.
    ///
    /// Returns the number of handler invocations. On error nothing is committed.
    async fn process_block(&self, block_number: u64, mut logs: Vec<RawLog>) -> Result<u64, IndexerError> {
        logs.sort_by_key(|log| log.log_index);

        let mut events_handled = 0_u64;
        let mut decode_errors = 0_u64;

        for raw_log in &logs {
            let Some(event) = self.decode_log(raw_log, &mut decode_errors) else {
                continue;
            };

            for filter in self.registry.matching(&event) {
                let handler = filter.handler();
                handler.handle(&event).await.map_err(|error| IndexerError::Handler {
                    handler: handler.name().to_string(),
                    event_name: event.event_name.clone(),
                    block_number,
                    log_index: event.log_index,
                    error,
                })?;
                events_handled += 1;
            }
        }

        self.engine_db
            .commit_block(&self.config.indexer_id, block_number, events_handled)
            .await
            .map_err(IndexerError::Cursor)?;

        tracing::debug!(
            target: "auco::etl::engine",
            block_number,
            logs = logs.len(),
            events_handled,
            decode_errors,
            "Block committed"
        );

        self.publish(|s| {
            s.cursor = Some(block_number);
            s.next_block = Some(block_number + 1);
            s.head = s.head.max(Some(block_number));
            s.blocks_processed += 1;
            s.events_handled += events_handled;
            s.decode_errors += decode_errors;
            s.consecutive_failures = 0;
        });

        Ok(events_handled)
    }

    /// First successful decode among the filters of the log's contract.
    ///
    /// A filter that claims the log but fails to decode it is reported and the
    /// remaining filters are still tried.
    fn decode_log(&self, raw_log: &RawLog, decode_errors: &mut u64) -> Option<DecodedEvent> {
        for filter in self.registry.filters_for(raw_log.from_address) {
            match decoder::decode(raw_log, filter) {
                Ok(Some(event)) => return Some(event),
                Ok(None) => {}
                Err(e) => {
                    *decode_errors += 1;
                    tracing::warn!(
                        target: "auco::etl::engine",
                        block_number = raw_log.block_number,
                        log_index = raw_log.log_index,
                        contract = %format!("{:#x}", raw_log.from_address),
                        error = %e,
                        "Skipping undecodable log"
                    );
                }
            }
        }
        None
    }

    /// Records a failed attempt and sleeps before the next one.
    ///
    /// Returns `false` if cancelled while sleeping.
    async fn back_off(&self, attempt: u32, error: IndexerError, shutdown: &CancellationToken) -> bool {
        let delay = self.config.block_backoff.delay_for(attempt);
        tracing::error!(
            target: "auco::etl::engine",
            attempt,
            retry_in = ?delay,
            error = %error,
            "Block processing failed, cursor not advanced"
        );
        self.publish(|s| {
            s.consecutive_failures = attempt;
            s.last_error = Some(error.to_string());
        });

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Parks in `Waiting` for one poll interval. Returns `false` if cancelled.
    async fn wait_for_block(&self, next_block: u64, shutdown: &CancellationToken) -> bool {
        self.publish(|s| s.state = SyncState::Waiting);
        tracing::trace!(target: "auco::etl::engine", next_block, "Waiting for next block");

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.poll_interval) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::decoder::ContractAbi;
    use crate::etl::extractor::MemoryChain;
    use crate::etl::registry::{handler_fn, EventFilter};
    use crate::etl::store::RecordStore;
    use starknet::core::types::Felt;
    use starknet::macros::selector;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const ABI: &str = r#"[
        {"type": "event", "name": "demo::Counter::Incremented", "kind": "struct", "members": [
            {"name": "amount", "type": "core::integer::u64", "kind": "data"}
        ]}
    ]"#;

    const CONTRACT: Felt = Felt::from_hex_unchecked("0x10");

    fn incremented(amount: u64) -> RawLog {
        RawLog {
            block_number: 0,
            log_index: 0,
            transaction_hash: Felt::ONE,
            from_address: CONTRACT,
            keys: vec![selector!("Incremented")],
            data: vec![Felt::from(amount)],
        }
    }

    fn config(starting_block: StartingBlock, stop_at: Option<u64>) -> SyncEngineConfig {
        SyncEngineConfig {
            indexer_id: "test".to_string(),
            starting_block,
            poll_interval: Duration::from_millis(10),
            block_backoff: RetryPolicy::new(u32::MAX, Duration::from_millis(5), Duration::from_millis(20), 2.0),
            stop_at,
        }
    }

    type Seen = Arc<Mutex<Vec<(u64, u64)>>>;

    /// Registry with one filter recording `(block, log_index)`; fails while `failures` > 0.
    fn recording_registry(failures: Arc<AtomicU32>) -> (Arc<HandlerRegistry>, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn("record", move |event: DecodedEvent| {
            let sink = sink.clone();
            let failures = failures.clone();
            async move {
                sink.lock().unwrap().push((event.block_number, event.log_index));
                if event.log_index == 1
                    && failures
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                {
                    anyhow::bail!("simulated store outage");
                }
                Ok(())
            }
        });

        let abi = ContractAbi::from_json(ABI).unwrap();
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventFilter::new(CONTRACT, &abi, "demo::Counter::Incremented", Arc::new(handler)).unwrap())
            .unwrap();
        (Arc::new(registry), seen)
    }

    async fn engine_db() -> EngineDb {
        let store = RecordStore::in_memory().await.unwrap();
        EngineDb::new(store.pool().clone()).await.unwrap()
    }

    #[tokio::test]
    async fn commits_blocks_in_order_until_stop_block() {
        let chain = Arc::new(MemoryChain::new());
        chain.push_block(0, vec![incremented(1), incremented(2)]);
        chain.push_block(1, vec![]);
        chain.push_block(2, vec![incremented(3)]);

        let (registry, seen) = recording_registry(Arc::new(AtomicU32::new(0)));
        let db = engine_db().await;
        let engine = SyncEngine::new(chain, registry, db.clone(), config(StartingBlock::Number(0), Some(2)));

        let next = engine.initialize().await.unwrap();
        assert_eq!(next, 0);
        tokio::time::timeout(Duration::from_secs(5), engine.run(next, CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(0, 0), (0, 1), (2, 0)]);
        assert_eq!(db.get_cursor("test").await.unwrap(), Some(2));

        let status = engine.status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.cursor, Some(2));
        assert_eq!(status.blocks_processed, 3);
        assert_eq!(status.events_handled, 3);
    }

    #[tokio::test]
    async fn failed_block_is_retried_from_its_first_event() {
        let chain = Arc::new(MemoryChain::new());
        chain.push_block(5, vec![incremented(1), incremented(2)]);

        let failures = Arc::new(AtomicU32::new(2));
        let (registry, seen) = recording_registry(failures);
        let db = engine_db().await;
        let engine = SyncEngine::new(chain, registry, db.clone(), config(StartingBlock::Number(5), Some(5)));

        let next = engine.initialize().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), engine.run(next, CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(5, 0), (5, 1), (5, 0), (5, 1), (5, 0), (5, 1)]
        );
        assert_eq!(db.get_cursor("test").await.unwrap(), Some(5));
        let status = engine.status();
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.unwrap().contains("simulated store outage"));
    }

    #[tokio::test]
    async fn handler_failure_leaves_cursor_unchanged() {
        let chain = Arc::new(MemoryChain::new());
        chain.push_block(0, vec![incremented(1), incremented(2)]);

        let (registry, _seen) = recording_registry(Arc::new(AtomicU32::new(1)));
        let db = engine_db().await;
        let engine = SyncEngine::new(chain, registry, db.clone(), config(StartingBlock::Number(0), None));

        let err = engine.sync_block(0).await.unwrap_err();
        assert!(matches!(err, IndexerError::Handler { log_index: 1, .. }));
        assert_eq!(db.get_cursor("test").await.unwrap(), None);

        let outcome = engine.sync_block(0).await.unwrap();
        assert_eq!(
            outcome,
            BlockOutcome::Committed {
                block_number: 0,
                events_handled: 2
            }
        );
        assert_eq!(db.get_cursor("test").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn undecodable_logs_are_skipped_and_counted() {
        let chain = Arc::new(MemoryChain::new());
        let mut malformed = incremented(0);
        malformed.data.clear();
        let foreign = RawLog {
            from_address: Felt::from(0x99_u64),
            ..incremented(7)
        };
        chain.push_block(0, vec![malformed, foreign, incremented(4)]);

        let (registry, seen) = recording_registry(Arc::new(AtomicU32::new(0)));
        let engine = SyncEngine::new(chain, registry, engine_db().await, config(StartingBlock::Number(0), None));

        engine.sync_block(0).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(0, 2)]);
        let status = engine.status();
        assert_eq!(status.decode_errors, 1);
        assert_eq!(status.events_handled, 1);
    }

    #[tokio::test]
    async fn chain_failures_are_retried_until_the_block_commits() {
        let chain = Arc::new(MemoryChain::new());
        chain.push_block(3, vec![incremented(1), incremented(2)]);
        chain.fail_next_fetches(2);

        let (registry, seen) = recording_registry(Arc::new(AtomicU32::new(0)));
        let db = engine_db().await;
        let engine = SyncEngine::new(chain.clone(), registry, db.clone(), config(StartingBlock::Number(3), Some(3)));

        let next = engine.initialize().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), engine.run(next, CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(db.get_cursor("test").await.unwrap(), Some(3));
        assert_eq!(chain.fetched_blocks(), vec![3, 3, 3]);
        assert_eq!(*seen.lock().unwrap(), vec![(3, 0), (3, 1)]);
        let status = engine.status();
        assert_eq!(status.events_handled, 2);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn decode_errors_count_once_per_committed_block() {
        let chain = Arc::new(MemoryChain::new());
        let mut malformed = incremented(0);
        malformed.data.clear();
        // The handler fails twice on log index 1, so the block is attempted three times.
        chain.push_block(0, vec![malformed, incremented(1), incremented(2)]);

        let (registry, _seen) = recording_registry(Arc::new(AtomicU32::new(2)));
        let engine = SyncEngine::new(chain, registry, engine_db().await, config(StartingBlock::Number(0), Some(0)));

        let next = engine.initialize().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), engine.run(next, CancellationToken::new()))
            .await
            .unwrap();

        let status = engine.status();
        assert_eq!(status.cursor, Some(0));
        assert_eq!(status.decode_errors, 1);
    }

    #[tokio::test]
    async fn persisted_cursor_wins_over_starting_block() {
        let chain = Arc::new(MemoryChain::new());
        chain.push_empty_blocks(0..=20);
        let (registry, _) = recording_registry(Arc::new(AtomicU32::new(0)));
        let db = engine_db().await;

        let engine = SyncEngine::new(chain.clone(), registry.clone(), db.clone(), config(StartingBlock::Latest, None));
        assert_eq!(engine.initialize().await.unwrap(), 20);

        db.set_cursor("test", 7).await.unwrap();
        let engine = SyncEngine::new(chain, registry, db, config(StartingBlock::Number(0), None));
        assert_eq!(engine.initialize().await.unwrap(), 8);
        assert_eq!(engine.status().cursor, Some(7));
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiting() {
        let chain = Arc::new(MemoryChain::new());
        chain.push_block(0, vec![]);
        let (registry, _) = recording_registry(Arc::new(AtomicU32::new(0)));
        let engine = Arc::new(SyncEngine::new(
            chain,
            registry,
            engine_db().await,
            SyncEngineConfig {
                poll_interval: Duration::from_secs(3600),
                ..config(StartingBlock::Number(0), None)
            },
        ));
        let mut status = engine.subscribe();

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let engine = engine.clone();
            let token = token.clone();
            async move { engine.run(0, token).await }
        });

        status
            .wait_for(|s| s.state == SyncState::Waiting)
            .await
            .unwrap();
        assert_eq!(engine.status().cursor, Some(0));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(engine.status().state, SyncState::Idle);
    }
}
