//! Event decoder adapter.
//!
//! [`decode`] is a pure function from a raw log and a registered filter to a typed
//! [`DecodedEvent`]. A log that belongs to another contract or event yields `Ok(None)`;
//! a log that claims to be the filtered event but does not fit its ABI layout is a
//! [`DecodeError`], so the gap can be reported instead of silently dropped.

mod abi;
mod value;

pub use abi::{CairoType, ContractAbi, EventAbi, EventMember, MemberKind};
pub use value::FieldValue;

use starknet::core::types::Felt;

use crate::error::DecodeError;
use crate::etl::registry::EventFilter;

/// A single event emission as delivered by the chain client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    /// Position of the emission within its block, across all transactions.
    pub log_index: u64,
    pub transaction_hash: Felt,
    pub from_address: Felt,
    /// `keys[0]` is the event selector.
    pub keys: Vec<Felt>,
    pub data: Vec<Felt>,
}

impl RawLog {
    pub fn selector(&self) -> Option<Felt> {
        self.keys.first().copied()
    }
}

/// An event decoded against a filter's ABI.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Felt,
    pub contract_address: Felt,
    /// Fully qualified event name, as registered.
    pub event_name: String,
    /// Members in ABI declaration order.
    pub fields: Vec<(String, FieldValue)>,
}

impl DecodedEvent {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

/// Decodes `raw_log` if it was emitted by the filter's contract with the filter's selector.
pub fn decode(raw_log: &RawLog, filter: &EventFilter) -> Result<Option<DecodedEvent>, DecodeError> {
    let event = filter.event();

    if raw_log.from_address != filter.contract_address()
        || raw_log.selector() != Some(event.selector())
    {
        return Ok(None);
    }

    let fields = event
        .decode_fields(&raw_log.keys[1..], &raw_log.data)
        .map_err(|reason| DecodeError {
            raw_log: raw_log.clone(),
            event_name: event.name().to_string(),
            selector: event.selector(),
            reason,
        })?;

    Ok(Some(DecodedEvent {
        block_number: raw_log.block_number,
        log_index: raw_log.log_index,
        transaction_hash: raw_log.transaction_hash,
        contract_address: raw_log.from_address,
        event_name: event.name().to_string(),
        fields,
    }))
}
