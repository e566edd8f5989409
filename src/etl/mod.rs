pub mod decoder;
pub mod engine;
pub mod engine_db;
pub mod extractor;
pub mod registry;
pub mod store;

pub use decoder::{decode, ContractAbi, DecodedEvent, EventAbi, FieldValue, RawLog};
pub use engine::{BlockOutcome, SyncEngine, SyncEngineConfig, SyncState, SyncStatus};
pub use engine_db::{EngineDb, EngineStats};
pub use extractor::{ChainClient, MemoryChain, RetryPolicy, StarknetChainClient};
pub use registry::{handler_fn, EventFilter, EventHandler, HandlerRegistry};
pub use store::{
    ColumnType, ColumnValue, EventKey, IndexedData, InsertOutcome, Record, RecordSchema,
    RecordStore, StoredRecord,
};
