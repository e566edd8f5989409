//! Starknet JSON-RPC chain client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use starknet::core::types::{
    BlockId, Event, Felt, MaybePreConfirmedBlockWithReceipts, StarknetError, TransactionReceipt,
};
use starknet::providers::jsonrpc::{HttpTransport, JsonRpcClient};
use starknet::providers::{Provider, ProviderError};
use std::sync::Arc;
use url::Url;

use super::{ChainClient, RetryPolicy};
use crate::etl::decoder::RawLog;

/// Chain client over a JSON-RPC node, with per-request retries.
#[derive(Clone)]
pub struct StarknetChainClient {
    provider: Arc<JsonRpcClient<HttpTransport>>,
    retry_policy: RetryPolicy,
    name: String,
}

impl StarknetChainClient {
    pub fn new(rpc_url: Url, retry_policy: RetryPolicy) -> Self {
        let name = format!("starknet@{rpc_url}");
        let provider = Arc::new(JsonRpcClient::new(HttpTransport::new(rpc_url)));
        Self {
            provider,
            retry_policy,
            name,
        }
    }

    pub fn from_provider(provider: Arc<JsonRpcClient<HttpTransport>>, retry_policy: RetryPolicy) -> Self {
        Self {
            provider,
            retry_policy,
            name: "starknet".to_string(),
        }
    }

    pub fn provider(&self) -> &Arc<JsonRpcClient<HttpTransport>> {
        &self.provider
    }
}

impl std::fmt::Debug for StarknetChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StarknetChainClient")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

#[async_trait]
impl ChainClient for StarknetChainClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn block_number(&self) -> Result<u64> {
        self.retry_policy
            .execute(|| {
                let provider = self.provider.clone();
                async move {
                    provider
                        .block_number()
                        .await
                        .context("Failed to fetch latest block number")
                }
            })
            .await
    }

    async fn block_logs(&self, block_number: u64) -> Result<Option<Vec<RawLog>>> {
        let block = self
            .retry_policy
            .execute(|| {
                let provider = self.provider.clone();
                async move {
                    match provider
                        .get_block_with_receipts(BlockId::Number(block_number))
                        .await
                    {
                        Ok(block) => Ok(Some(block)),
                        Err(ProviderError::StarknetError(StarknetError::BlockNotFound)) => Ok(None),
                        Err(e) => Err(anyhow::Error::new(e))
                            .with_context(|| format!("Failed to fetch block {block_number} with receipts")),
                    }
                }
            })
            .await?;

        let block = match block {
            Some(MaybePreConfirmedBlockWithReceipts::Block(block)) => block,
            Some(MaybePreConfirmedBlockWithReceipts::PreConfirmedBlock(_)) => {
                // The node answered with a block that is not accepted yet.
                tracing::debug!(
                    target: "auco::etl::extractor",
                    block_number,
                    "Block is pre-confirmed, treating as not available"
                );
                return Ok(None);
            }
            None => return Ok(None),
        };

        let receipts = block
            .transactions
            .into_iter()
            .map(|tx| receipt_events(tx.receipt));

        Ok(Some(flatten_events(block.block_number, receipts)))
    }
}

fn receipt_events(receipt: TransactionReceipt) -> (Felt, Vec<Event>) {
    match receipt {
        TransactionReceipt::Invoke(r) => (r.transaction_hash, r.events),
        TransactionReceipt::L1Handler(r) => (r.transaction_hash, r.events),
        TransactionReceipt::Declare(r) => (r.transaction_hash, r.events),
        TransactionReceipt::Deploy(r) => (r.transaction_hash, r.events),
        TransactionReceipt::DeployAccount(r) => (r.transaction_hash, r.events),
    }
}

/// Numbers the events of a block in transaction order, starting at 0.
fn flatten_events(
    block_number: u64,
    receipts: impl IntoIterator<Item = (Felt, Vec<Event>)>,
) -> Vec<RawLog> {
    let mut logs = Vec::new();
    for (transaction_hash, events) in receipts {
        for event in events {
            logs.push(RawLog {
                block_number,
                log_index: logs.len() as u64,
                transaction_hash,
                from_address: event.from_address,
                keys: event.keys,
                data: event.data,
            });
        }
    }
    logs
}
