//! Handler registry: routes decoded events to the handlers registered for them.
//!
//! Routing is an explicit table keyed by `(contract address, event name)`. Registration
//! order is preserved so handler side effects are reproducible across runs.

use async_trait::async_trait;
use starknet::core::types::Felt;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::IndexerError;
use crate::etl::decoder::{ContractAbi, DecodedEvent, EventAbi};

/// Asynchronous consumer of decoded events.
///
/// Handlers are awaited before the block advances. Returning an error aborts the block
/// and it is re-delivered after a backoff, so a handler may see the same event twice.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn handle(&self, event: &DecodedEvent) -> anyhow::Result<()>;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wraps an async closure as an [`EventHandler`].
///
/// ```rust,ignore
/// let handler = handler_fn("log", |event| async move {
///     tracing::info!("{} at block {}", event.event_name, event.block_number);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(DecodedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DecodedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DecodedEvent) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// A registered interest in one event of one contract. Immutable once built.
#[derive(Clone)]
pub struct EventFilter {
    contract_address: Felt,
    event: Arc<EventAbi>,
    handler: Arc<dyn EventHandler>,
}

impl EventFilter {
    /// Builds a filter, resolving `event_name` against the contract ABI.
    pub fn new(
        contract_address: Felt,
        abi: &ContractAbi,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, IndexerError> {
        let event = abi.event(event_name)?;
        Ok(Self {
            contract_address,
            event: Arc::new(event),
            handler,
        })
    }

    pub fn contract_address(&self) -> Felt {
        self.contract_address
    }

    pub fn event_name(&self) -> &str {
        self.event.name()
    }

    pub fn event(&self) -> &EventAbi {
        &self.event
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("contract_address", &format_args!("{:#x}", self.contract_address))
            .field("event_name", &self.event.name())
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Registry of event filters, owned by the service and read by the sync engine.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    /// Filters in registration order.
    filters: Vec<EventFilter>,
    /// `(contract, event name)` pairs already taken.
    keys: HashSet<(Felt, String)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter, rejecting a second filter for the same contract and event.
    ///
    /// The registry is left untouched when registration fails.
    pub fn register(&mut self, filter: EventFilter) -> Result<(), IndexerError> {
        let key = (filter.contract_address(), filter.event_name().to_string());
        if self.keys.contains(&key) {
            return Err(IndexerError::DuplicateFilter {
                contract_address: key.0,
                event_name: key.1,
            });
        }

        tracing::info!(
            target: "auco::etl::registry",
            contract = %format!("{:#x}", filter.contract_address()),
            event = filter.event_name(),
            handler = filter.handler().name(),
            "registered event filter"
        );

        self.keys.insert(key);
        self.filters.push(filter);
        Ok(())
    }

    /// Filters whose contract and event name equal the event's, in registration order.
    pub fn matching(&self, event: &DecodedEvent) -> Vec<&EventFilter> {
        self.filters
            .iter()
            .filter(|f| {
                f.contract_address() == event.contract_address && f.event_name() == event.event_name
            })
            .collect()
    }

    /// Filters registered on `contract_address`, in registration order.
    pub fn filters_for(&self, contract_address: Felt) -> impl Iterator<Item = &EventFilter> {
        self.filters
            .iter()
            .filter(move |f| f.contract_address() == contract_address)
    }

    pub fn filters(&self) -> &[EventFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
