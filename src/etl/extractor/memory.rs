//! In-memory chain, for tests and local demos.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::ChainClient;
use crate::etl::decoder::RawLog;

#[derive(Debug, Default)]
struct ChainState {
    blocks: BTreeMap<u64, Vec<RawLog>>,
    /// Overrides the head derived from `blocks`.
    head: Option<u64>,
    /// Number of upcoming `block_logs` calls that fail.
    failing_fetches: u32,
    fetched: Vec<u64>,
}

/// Chain whose blocks are pushed by the caller.
///
/// The head is the highest pushed block unless set explicitly. Fetch failures can be
/// injected to exercise the retry path.
#[derive(Debug, Default)]
pub struct MemoryChain {
    state: Mutex<ChainState>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `logs` as block `block_number`, fixing up their block number and log index.
    pub fn push_block(&self, block_number: u64, logs: Vec<RawLog>) {
        let logs = logs
            .into_iter()
            .enumerate()
            .map(|(idx, log)| RawLog {
                block_number,
                log_index: idx as u64,
                ..log
            })
            .collect();
        self.state().blocks.insert(block_number, logs);
    }

    /// Pushes empty blocks for every number in `range` not already present.
    pub fn push_empty_blocks(&self, range: std::ops::RangeInclusive<u64>) {
        let mut state = self.state();
        for block_number in range {
            state.blocks.entry(block_number).or_default();
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = Some(head);
    }

    /// Makes the next `count` block fetches fail.
    pub fn fail_next_fetches(&self, count: u32) {
        self.state().failing_fetches = count;
    }

    /// Block numbers passed to successful and failed fetches, in call order.
    pub fn fetched_blocks(&self) -> Vec<u64> {
        self.state().fetched.clone()
    }
}

#[async_trait]
impl ChainClient for MemoryChain {
    fn name(&self) -> &str {
        "memory"
    }

    async fn block_number(&self) -> Result<u64> {
        let state = self.state();
        Ok(state
            .head
            .or_else(|| state.blocks.keys().next_back().copied())
            .unwrap_or_default())
    }

    async fn block_logs(&self, block_number: u64) -> Result<Option<Vec<RawLog>>> {
        let mut state = self.state();
        state.fetched.push(block_number);

        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            anyhow::bail!("injected fetch failure for block {block_number}");
        }

        let head = state
            .head
            .or_else(|| state.blocks.keys().next_back().copied())
            .unwrap_or_default();
        if block_number > head {
            return Ok(None);
        }

        Ok(Some(state.blocks.get(&block_number).cloned().unwrap_or_default()))
    }
}
