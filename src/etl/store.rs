//! Append-only record store on SQLite.
//!
//! One table per record kind, each with a surrogate `id INTEGER PRIMARY KEY AUTOINCREMENT`
//! (monotonic, never reused), the domain columns, and an ISO-8601 `timestamp` set at
//! insertion. Rows are never updated or deleted. The pool runs in WAL mode so readers
//! see a consistent snapshot while the sync loop appends.

use chrono::{SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool};
use starknet::core::types::Felt;
use std::path::Path;
use std::time::Duration;

use crate::error::IndexerError;
use crate::etl::decoder::DecodedEvent;

/// Ledger of events already persisted through [`RecordStore::insert_once`].
const EVENT_LEDGER_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS indexed_events (
    contract_address TEXT NOT NULL,
    event_name TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    log_index INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    record_id INTEGER,
    UNIQUE(contract_address, event_name, block_number, log_index)
)";

const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
}

impl ColumnType {
    pub fn as_sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Text(String),
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Null => serializer.serialize_none(),
            ColumnValue::Integer(v) => serializer.serialize_i64(*v),
            ColumnValue::Text(v) => serializer.serialize_str(v),
        }
    }
}

/// Table layout of one record kind. `id` and `timestamp` are added by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    table: String,
    columns: Vec<(String, ColumnType)>,
}

impl RecordSchema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push((name.into(), ty));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[(String, ColumnType)] {
        &self.columns
    }

    fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, ty)| *ty)
    }

    fn create_sql(&self) -> String {
        let mut columns = vec!["\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
        columns.extend(
            self.columns
                .iter()
                .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.as_sql())),
        );
        columns.push(format!("{} TEXT NOT NULL", quote_ident(TIMESTAMP_COLUMN)));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.table),
            columns.join(", ")
        )
    }
}

/// Values of one row to append, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    values: Vec<(String, ColumnValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// A persisted row. Serializes as a flat object: `id`, the domain columns, `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub fields: Vec<(String, ColumnValue)>,
    pub timestamp: String,
}

impl StoredRecord {
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

impl Serialize for StoredRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 2))?;
        map.serialize_entry("id", &self.id)?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.serialize_entry(TIMESTAMP_COLUMN, &self.timestamp)?;
        map.end()
    }
}

/// Result of the read API: every committed record, plus a count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedData<T> {
    pub events: Vec<T>,
    pub total: usize,
}

impl<T> IndexedData<T> {
    pub fn new(events: Vec<T>) -> Self {
        let total = events.len();
        Self { events, total }
    }
}

/// Identity of an event occurrence, used to persist it at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub contract_address: Felt,
    pub event_name: String,
    pub block_number: u64,
    pub log_index: u64,
}

impl From<&DecodedEvent> for EventKey {
    fn from(event: &DecodedEvent) -> Self {
        Self {
            contract_address: event.contract_address,
            event_name: event.event_name.clone(),
            block_number: event.block_number,
            log_index: event.log_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The event was already persisted, under this row id when known.
    Duplicate(Option<i64>),
}

/// SQLite-backed store shared by the sync engine (writes) and readers.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Opens (or creates) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                IndexerError::Initialization(format!(
                    "failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                IndexerError::Initialization(format!(
                    "failed to open store {}: {e}",
                    path.display()
                ))
            })?;

        tracing::info!(
            target: "auco::etl::store",
            path = %path.display(),
            "Record store opened (WAL, synchronous=NORMAL)"
        );

        Self::with_pool(pool).await
    }

    /// In-memory store backed by a single connection, mostly for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // Every connection to `:memory:` is a separate database: pin exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| IndexerError::Initialization(format!("failed to open in-memory store: {e}")))?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, IndexerError> {
        sqlx::query(EVENT_LEDGER_SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| IndexerError::Initialization(format!("failed to create event ledger: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the table for `schema` if absent. Existing tables and rows are left as is.
    pub async fn ensure_schema(&self, schema: &RecordSchema) -> Result<(), IndexerError> {
        sqlx::query(&schema.create_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| IndexerError::store_write(format!("create table {}", schema.table()), e))?;

        tracing::debug!(
            target: "auco::etl::store",
            table = schema.table(),
            columns = schema.columns().len(),
            "Schema ensured"
        );
        Ok(())
    }

    /// Appends one row and returns its id. The insert is a single statement, so it is atomic.
    pub async fn insert(&self, schema: &RecordSchema, record: &Record) -> Result<i64, IndexerError> {
        insert_row(&self.pool, schema, record).await
    }

    /// Appends one row unless `key` was already persisted.
    ///
    /// The ledger claim and the row insert share one transaction, so a crash between the
    /// two leaves neither behind.
    pub async fn insert_once(
        &self,
        schema: &RecordSchema,
        record: &Record,
        key: &EventKey,
    ) -> Result<InsertOutcome, IndexerError> {
        let address = format!("{:#x}", key.contract_address);
        let context = || format!("insert {} once", schema.table());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexerError::store_write(context(), e))?;

        let claimed = sqlx::query(
            "INSERT OR IGNORE INTO indexed_events \
             (contract_address, event_name, block_number, log_index, table_name) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&address)
        .bind(&key.event_name)
        .bind(key.block_number as i64)
        .bind(key.log_index as i64)
        .bind(schema.table())
        .execute(&mut *tx)
        .await
        .map_err(|e| IndexerError::store_write(context(), e))?
        .rows_affected();

        if claimed == 0 {
            let existing: Option<Option<i64>> = sqlx::query_scalar(
                "SELECT record_id FROM indexed_events \
                 WHERE contract_address = ? AND event_name = ? AND block_number = ? AND log_index = ?",
            )
            .bind(&address)
            .bind(&key.event_name)
            .bind(key.block_number as i64)
            .bind(key.log_index as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| IndexerError::store_write(context(), e))?;

            tx.rollback()
                .await
                .map_err(|e| IndexerError::store_write(context(), e))?;
            return Ok(InsertOutcome::Duplicate(existing.flatten()));
        }

        let id = insert_row(&mut *tx, schema, record).await?;

        sqlx::query(
            "UPDATE indexed_events SET record_id = ? \
             WHERE contract_address = ? AND event_name = ? AND block_number = ? AND log_index = ?",
        )
        .bind(id)
        .bind(&address)
        .bind(&key.event_name)
        .bind(key.block_number as i64)
        .bind(key.log_index as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| IndexerError::store_write(context(), e))?;

        tx.commit()
            .await
            .map_err(|e| IndexerError::store_write(context(), e))?;

        Ok(InsertOutcome::Inserted(id))
    }

    /// All committed rows of `schema`, ordered by id ascending.
    pub async fn query_all(&self, schema: &RecordSchema) -> Result<Vec<StoredRecord>, IndexerError> {
        let mut columns = vec![quote_ident("id")];
        columns.extend(schema.columns().iter().map(|(name, _)| quote_ident(name)));
        columns.push(quote_ident(TIMESTAMP_COLUMN));

        let sql = format!(
            "SELECT {} FROM {} ORDER BY \"id\" ASC",
            columns.join(", "),
            quote_ident(schema.table())
        );

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IndexerError::store_read(format!("query {}", schema.table()), e))?;

        rows.iter()
            .map(|row| read_row(schema, row))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| IndexerError::store_read(format!("decode {} row", schema.table()), e))
    }

    pub async fn count(&self, schema: &RecordSchema) -> Result<u64, IndexerError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(schema.table()));
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| IndexerError::store_read(format!("count {}", schema.table()), e))?;
        Ok(count as u64)
    }

    /// Snapshot of every committed record, as exposed to consumers.
    pub async fn indexed_data(
        &self,
        schema: &RecordSchema,
    ) -> Result<IndexedData<StoredRecord>, IndexerError> {
        Ok(IndexedData::new(self.query_all(schema).await?))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

fn validate(schema: &RecordSchema, record: &Record) -> Result<(), IndexerError> {
    let invalid = |reason: String| IndexerError::InvalidRecord {
        table: schema.table().to_string(),
        reason,
    };

    for (name, value) in &record.values {
        let ty = schema
            .column_type(name)
            .ok_or_else(|| invalid(format!("unknown column {name}")))?;
        match (ty, value) {
            (_, ColumnValue::Null)
            | (ColumnType::Integer, ColumnValue::Integer(_))
            | (ColumnType::Text, ColumnValue::Text(_)) => {}
            _ => return Err(invalid(format!("column {name} expects {}", ty.as_sql()))),
        }
    }
    Ok(())
}

async fn insert_row<'e, E>(executor: E, schema: &RecordSchema, record: &Record) -> Result<i64, IndexerError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    validate(schema, record)?;

    let mut columns: Vec<String> = record.values.iter().map(|(name, _)| quote_ident(name)).collect();
    columns.push(quote_ident(TIMESTAMP_COLUMN));
    let placeholders = vec!["?"; columns.len()].join(", ");

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(schema.table()),
        columns.join(", "),
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in &record.values {
        query = match value {
            ColumnValue::Null => query.bind(Option::<String>::None),
            ColumnValue::Integer(v) => query.bind(*v),
            ColumnValue::Text(v) => query.bind(v.clone()),
        };
    }
    query = query.bind(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));

    let result = query
        .execute(executor)
        .await
        .map_err(|e| IndexerError::store_write(format!("insert into {}", schema.table()), e))?;

    Ok(result.last_insert_rowid())
}

fn read_row(schema: &RecordSchema, row: &SqliteRow) -> Result<StoredRecord, sqlx::Error> {
    let id: i64 = row.try_get(0)?;
    let mut fields = Vec::with_capacity(schema.columns().len());
    for (idx, (name, ty)) in schema.columns().iter().enumerate() {
        let value = match ty {
            ColumnType::Integer => row
                .try_get::<Option<i64>, _>(idx + 1)?
                .map_or(ColumnValue::Null, ColumnValue::Integer),
            ColumnType::Text => row
                .try_get::<Option<String>, _>(idx + 1)?
                .map_or(ColumnValue::Null, ColumnValue::Text),
        };
        fields.push((name.clone(), value));
    }
    let timestamp: String = row.try_get(schema.columns().len() + 1)?;
    Ok(StoredRecord {
        id,
        fields,
        timestamp,
    })
}
