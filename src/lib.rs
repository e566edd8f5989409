//! Auco - Starknet event indexer.
//!
//! Walks a chain block by block, decodes the events of registered contracts against
//! their ABI and hands them to async handlers, which append rows to a SQLite store.
//! The sync cursor only advances once every handler of a block has completed, so a
//! restart resumes exactly after the last fully persisted block.
//!
//! ```rust,ignore
//! let config = IndexerConfig::builder()
//!     .chain_endpoint("http://127.0.0.1:5050")
//!     .starting_block(StartingBlock::Latest)
//!     .build()?;
//!
//! let mut service = IndexerService::new(config).await;
//! service.register(EventFilter::new(address, &abi, "my::Contract::Event", handler)?)?;
//! assert!(service.start().await);
//! ```

pub mod config;
pub mod error;
pub mod etl;
pub mod http;
pub mod service;

// Re-export commonly used types for handler authors
pub use async_trait::async_trait;
pub use axum;
pub use tokio;

pub use config::{IndexerConfig, IndexerConfigBuilder, StartingBlock};
pub use error::{DecodeError, IndexerError};
pub use etl::{
    DecodedEvent, EventFilter, EventHandler, FieldValue, IndexedData, RecordSchema, RecordStore,
    SyncState, SyncStatus,
};
pub use http::create_http_router;
pub use service::IndexerService;
