//! Greeting table on the shared record store.

use auco::etl::store::{
    ColumnType, ColumnValue, EventKey, IndexedData, InsertOutcome, Record, RecordSchema,
    RecordStore, StoredRecord,
};
use auco::IndexerError;
use serde::{Deserialize, Serialize};
use starknet::core::types::Felt;

pub const GREETING_TABLE: &str = "Greeting";

pub fn greeting_schema() -> RecordSchema {
    RecordSchema::new(GREETING_TABLE)
        .column("greeting_setter", ColumnType::Text)
        .column("greeting", ColumnType::Text)
        .column("premium", ColumnType::Integer)
        .column("value", ColumnType::Integer)
}

/// A greeting change to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGreeting {
    pub greeting_setter: Felt,
    pub greeting: String,
    pub premium: bool,
    /// 0 when the event carried no value.
    pub value: i64,
}

impl From<&NewGreeting> for Record {
    fn from(greeting: &NewGreeting) -> Self {
        Record::new()
            .with("greeting_setter", format!("{:#x}", greeting.greeting_setter))
            .with("greeting", greeting.greeting.as_str())
            .with("premium", greeting.premium)
            .with("value", greeting.value)
    }
}

/// A persisted greeting, as served to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingRow {
    pub id: i64,
    pub greeting_setter: Option<String>,
    pub greeting: Option<String>,
    pub premium: Option<i64>,
    pub value: Option<i64>,
    pub timestamp: String,
}

impl TryFrom<StoredRecord> for GreetingRow {
    type Error = IndexerError;

    fn try_from(record: StoredRecord) -> Result<Self, Self::Error> {
        let invalid = |column: &str| IndexerError::InvalidRecord {
            table: GREETING_TABLE.to_string(),
            reason: format!("row {} has an unexpected {column} value", record.id),
        };

        let text = |column: &str| match record.get(column) {
            Some(ColumnValue::Text(v)) => Ok(Some(v.clone())),
            Some(ColumnValue::Null) | None => Ok(None),
            Some(ColumnValue::Integer(_)) => Err(invalid(column)),
        };
        let integer = |column: &str| match record.get(column) {
            Some(ColumnValue::Integer(v)) => Ok(Some(*v)),
            Some(ColumnValue::Null) | None => Ok(None),
            Some(ColumnValue::Text(_)) => Err(invalid(column)),
        };

        Ok(Self {
            id: record.id,
            greeting_setter: text("greeting_setter")?,
            greeting: text("greeting")?,
            premium: integer("premium")?,
            value: integer("value")?,
            timestamp: record.timestamp.clone(),
        })
    }
}

/// Typed access to the `Greeting` table.
#[derive(Debug, Clone)]
pub struct GreetingStorage {
    store: RecordStore,
    schema: RecordSchema,
}

impl GreetingStorage {
    /// Creates the table if needed. Existing rows are kept.
    pub async fn new(store: RecordStore) -> Result<Self, IndexerError> {
        let schema = greeting_schema();
        store.ensure_schema(&schema).await?;
        Ok(Self { store, schema })
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub async fn insert(&self, greeting: &NewGreeting) -> Result<i64, IndexerError> {
        self.store.insert(&self.schema, &Record::from(greeting)).await
    }

    /// Inserts unless the event identified by `key` was already stored.
    pub async fn insert_once(
        &self,
        greeting: &NewGreeting,
        key: &EventKey,
    ) -> Result<InsertOutcome, IndexerError> {
        self.store
            .insert_once(&self.schema, &Record::from(greeting), key)
            .await
    }

    pub async fn count(&self) -> Result<u64, IndexerError> {
        self.store.count(&self.schema).await
    }

    /// Every committed greeting, ordered by id.
    pub async fn indexed_data(&self) -> Result<IndexedData<GreetingRow>, IndexerError> {
        let rows = self
            .store
            .query_all(&self.schema)
            .await?
            .into_iter()
            .map(GreetingRow::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IndexedData::new(rows))
    }
}
