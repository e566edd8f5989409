//! Chain clients: where raw logs come from.

pub mod jsonrpc;
pub mod memory;
pub mod retry;

use anyhow::Result;
use async_trait::async_trait;

use crate::etl::decoder::RawLog;

pub use jsonrpc::StarknetChainClient;
pub use memory::MemoryChain;
pub use retry::RetryPolicy;

/// Read access to a Starknet-style chain, one block at a time.
///
/// Implementations return errors for transport failures. A block that does not exist
/// yet is not an error: [`ChainClient::block_logs`] returns `Ok(None)` for it.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Number of the latest accepted block.
    async fn block_number(&self) -> Result<u64>;

    /// Every event emitted in block `block_number`, with `log_index` set to the
    /// emission position within the block.
    async fn block_logs(&self, block_number: u64) -> Result<Option<Vec<RawLog>>>;
}
