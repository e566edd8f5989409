//! `GreetingChanged` handler.

use anyhow::{Context, Result};
use async_trait::async_trait;
use auco::etl::decoder::DecodedEvent;
use auco::etl::store::{EventKey, InsertOutcome};
use auco::EventHandler;

use crate::storage::{GreetingStorage, NewGreeting};

/// Persists every `GreetingChanged` event as a `Greeting` row.
///
/// By default a replayed event (same contract, event, block and log index) is recognized
/// and skipped, so retried blocks do not duplicate rows.
#[derive(Debug, Clone)]
pub struct GreetingHandler {
    storage: GreetingStorage,
    dedup: bool,
}

impl GreetingHandler {
    pub fn new(storage: GreetingStorage) -> Self {
        Self {
            storage,
            dedup: true,
        }
    }

    /// Appends on every delivery, duplicates included.
    pub fn without_dedup(mut self) -> Self {
        self.dedup = false;
        self
    }

    pub fn storage(&self) -> &GreetingStorage {
        &self.storage
    }
}

/// Maps the decoded event members onto a greeting row.
pub fn greeting_from_event(event: &DecodedEvent) -> Result<NewGreeting> {
    let field = |name: &str| {
        event
            .field(name)
            .with_context(|| format!("{} has no {name} member", event.event_name))
    };

    let greeting_setter = field("greeting_setter")?
        .as_felt()
        .context("greeting_setter is not an address")?;
    let greeting = field("new_greeting")?
        .as_str()
        .context("new_greeting is not a string")?
        .to_string();
    let premium = field("premium")?
        .as_bool()
        .context("premium is not a bool")?;

    let value = match field("value")?.as_option() {
        Some(None) => 0,
        Some(Some(inner)) => {
            let raw = inner
                .as_u128()
                .with_context(|| format!("value {inner} does not fit in 128 bits"))?;
            i64::try_from(raw).with_context(|| format!("value {raw} does not fit an INTEGER column"))?
        }
        None => anyhow::bail!("value is not an optional"),
    };

    Ok(NewGreeting {
        greeting_setter,
        greeting,
        premium,
        value,
    })
}

#[async_trait]
impl EventHandler for GreetingHandler {
    fn name(&self) -> &str {
        "greeting"
    }

    async fn handle(&self, event: &DecodedEvent) -> Result<()> {
        let greeting = greeting_from_event(event)?;

        if !self.dedup {
            let id = self.storage.insert(&greeting).await?;
            tracing::info!(
                target: "auco_greeting::handler",
                id,
                block_number = event.block_number,
                greeting = %greeting.greeting,
                "Greeting stored"
            );
            return Ok(());
        }

        match self.storage.insert_once(&greeting, &EventKey::from(event)).await? {
            InsertOutcome::Inserted(id) => tracing::info!(
                target: "auco_greeting::handler",
                id,
                block_number = event.block_number,
                greeting = %greeting.greeting,
                "Greeting stored"
            ),
            InsertOutcome::Duplicate(id) => tracing::debug!(
                target: "auco_greeting::handler",
                id = ?id,
                block_number = event.block_number,
                log_index = event.log_index,
                "Greeting already stored, skipping replay"
            ),
        }
        Ok(())
    }
}
