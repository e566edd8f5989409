//! Error taxonomy of the indexer.
//!
//! Errors local to a single log ([`DecodeError`]) are contained by the sync engine,
//! while everything that threatens cursor correctness aborts the current block.

use starknet::core::types::Felt;
use thiserror::Error;

use crate::etl::decoder::RawLog;

/// A log matched a filter's address and selector but its payload does not fit the ABI.
#[derive(Debug, Clone, Error)]
#[error(
    "failed to decode {event_name} (selector {selector:#x}) at block {} log {}: {reason}",
    .raw_log.block_number,
    .raw_log.log_index
)]
pub struct DecodeError {
    /// The offending log, kept for diagnostics.
    pub raw_log: RawLog,
    /// Fully qualified event name the filter expected.
    pub event_name: String,
    /// Expected event selector (`keys[0]`).
    pub selector: Felt,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum IndexerError {
    /// The chain client, the store or a filter could not be constructed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("store write failed ({context}): {source}")]
    StoreWrite {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("store read failed ({context}): {source}")]
    StoreRead {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// A record does not fit the schema it is written against.
    #[error("invalid record for table {table}: {reason}")]
    InvalidRecord { table: String, reason: String },

    #[error("a filter for {event_name} on {contract_address:#x} is already registered")]
    DuplicateFilter {
        contract_address: Felt,
        event_name: String,
    },

    #[error("chain client error: {0:#}")]
    Chain(anyhow::Error),

    #[error("handler {handler} failed on {event_name} (block {block_number}, log {log_index}): {error:#}")]
    Handler {
        handler: String,
        event_name: String,
        block_number: u64,
        log_index: u64,
        error: anyhow::Error,
    },

    #[error("cursor store error: {0:#}")]
    Cursor(anyhow::Error),
}

impl IndexerError {
    pub(crate) fn store_write(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::StoreWrite {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn store_read(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::StoreRead {
            context: context.into(),
            source,
        }
    }

    /// Returns `true` when the failure came from the persistence layer,
    /// either directly or wrapped inside a handler error.
    pub fn is_store_write(&self) -> bool {
        match self {
            Self::StoreWrite { .. } | Self::Cursor(_) => true,
            Self::Handler { error, .. } => error
                .downcast_ref::<IndexerError>()
                .is_some_and(IndexerError::is_store_write),
            _ => false,
        }
    }
}
