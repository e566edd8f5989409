//! Command line configuration for the greeting indexer.

use anyhow::{Context, Result};
use auco::{IndexerConfig, StartingBlock};
use clap::Parser;
use starknet::core::types::Felt;
use std::time::Duration;

/// Greeting indexer for Starknet
///
/// Follows the chain block by block and stores every GreetingChanged event of
/// YourContract in SQLite.
#[derive(Parser, Debug)]
#[command(name = "auco-indexer")]
#[command(about = "Index YourContract greetings on Starknet", long_about = None)]
pub struct Config {
    /// Starknet RPC URL
    #[arg(long, env = "RPC_URL", default_value = auco::config::DEFAULT_CHAIN_ENDPOINT)]
    pub rpc_url: String,

    /// First block to index: a number, or "latest" to skip history
    ///
    /// Ignored once a cursor has been persisted.
    #[arg(long, env = "STARTING_BLOCK_NUMBER", default_value = "0")]
    pub starting_block: StartingBlock,

    /// SQLite database holding greetings and the sync cursor
    #[arg(long, env = "SQLITE_DB_PATH", default_value = auco::config::DEFAULT_STORE_LOCATION)]
    pub db_path: String,

    /// Network whose deployed contract manifest is used (devnet, sepolia, mainnet)
    #[arg(long, env = "NETWORK", default_value = auco::config::DEFAULT_NETWORK)]
    pub network: String,

    /// Override of the YourContract address from the manifest
    #[arg(long)]
    pub contract_address: Option<String>,

    /// Seconds between head polls once caught up
    #[arg(long, default_value = "3")]
    pub poll_interval_secs: u64,

    /// Seconds to wait for the in-flight block on shutdown
    #[arg(long, default_value = "30")]
    pub shutdown_timeout_secs: u64,

    /// Host for the HTTP API
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP API
    #[arg(long, default_value = "3000")]
    pub port: u16,
}

impl Config {
    pub fn indexer_config(&self) -> Result<IndexerConfig> {
        IndexerConfig::builder()
            .chain_endpoint(&self.rpc_url)
            .starting_block(self.starting_block)
            .store_location(&self.db_path)
            .network(&self.network)
            .poll_interval(Duration::from_secs(self.poll_interval_secs))
            .shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
            .build()
            .context("Invalid indexer configuration")
    }

    pub fn parse_contract_address(&self) -> Result<Option<Felt>> {
        self.contract_address
            .as_deref()
            .map(|s| Felt::from_hex(s).with_context(|| format!("Invalid contract address '{s}'")))
            .transpose()
    }
}
