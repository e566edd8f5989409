//! Greeting indexer for the `YourContract` scaffold contract.
//!
//! Every `GreetingChanged` event is stored as a row of the `Greeting` table and served
//! back through `GET /greetings`.
//!
//! ```rust,ignore
//! let mut service = IndexerService::new(config).await;
//! let store = service.store().cloned().context("store unavailable")?;
//! let storage = GreetingStorage::new(store).await?;
//!
//! service.register(greeting_filter("devnet", None, storage.clone())?)?;
//! service.start().await;
//! ```

pub mod contracts;
pub mod handler;
pub mod http;
pub mod storage;

use auco::{EventFilter, IndexerError};
use starknet::core::types::Felt;
use std::sync::Arc;

pub use contracts::{contract_by_name, networks, DeployedContract};
pub use handler::{greeting_from_event, GreetingHandler};
pub use http::greeting_routes;
pub use storage::{greeting_schema, GreetingRow, GreetingStorage, NewGreeting, GREETING_TABLE};

pub const CONTRACT_NAME: &str = "YourContract";

pub const GREETING_CHANGED: &str = "contracts::YourContract::YourContract::GreetingChanged";

/// Builds the `GreetingChanged` filter for `network`.
///
/// `address` overrides the manifest address, e.g. for a freshly redeployed contract.
pub fn greeting_filter(
    network: &str,
    address: Option<Felt>,
    storage: GreetingStorage,
) -> Result<EventFilter, IndexerError> {
    let contract = contract_by_name(network, CONTRACT_NAME)?;
    EventFilter::new(
        address.unwrap_or(contract.address),
        &contract.abi,
        GREETING_CHANGED,
        Arc::new(GreetingHandler::new(storage)),
    )
}
