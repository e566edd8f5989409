//! End-to-end tests: in-memory chain -> sync engine -> greeting handler -> SQLite.

use auco::etl::{EngineDb, HandlerRegistry, MemoryChain, RawLog, SyncEngine, SyncEngineConfig};
use auco::{IndexerConfig, IndexerService, StartingBlock};
use auco_greeting::{contract_by_name, greeting_filter, GreetingStorage, CONTRACT_NAME};
use starknet::core::types::Felt;
use starknet::core::utils::cairo_short_string_to_felt;
use starknet::macros::selector;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn contract_address() -> Felt {
    contract_by_name("devnet", CONTRACT_NAME).unwrap().address
}

/// Raw `GreetingChanged` log. `greeting` must fit in a single pending word.
fn greeting_changed(setter: u64, greeting: &str, premium: bool, value: Option<u128>) -> RawLog {
    let mut keys = vec![selector!("GreetingChanged"), Felt::from(setter), Felt::ZERO];
    keys.push(if greeting.is_empty() {
        Felt::ZERO
    } else {
        cairo_short_string_to_felt(greeting).unwrap()
    });
    keys.push(Felt::from(greeting.len() as u64));

    let mut data = vec![Felt::from(u8::from(premium))];
    match value {
        Some(v) => data.extend([Felt::ZERO, Felt::from(v), Felt::ZERO]),
        None => data.push(Felt::ONE),
    }

    RawLog {
        block_number: 0,
        log_index: 0,
        transaction_hash: Felt::from(0xfeed_u64),
        from_address: contract_address(),
        keys,
        data,
    }
}

fn config(dir: &TempDir, stop_at: Option<u64>) -> IndexerConfig {
    let mut builder = IndexerConfig::builder()
        .store_location(dir.path().join("indexer.db"))
        .starting_block(StartingBlock::Number(0))
        .poll_interval(Duration::from_millis(10))
        .retry_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .shutdown_timeout(Duration::from_secs(5));
    if let Some(block) = stop_at {
        builder = builder.stop_at(block);
    }
    builder.build().unwrap()
}

async fn service_with_greetings(
    dir: &TempDir,
    chain: Arc<MemoryChain>,
    stop_at: Option<u64>,
) -> (IndexerService, GreetingStorage) {
    let mut service = IndexerService::with_chain_client(config(dir, stop_at), chain).await;
    let storage = GreetingStorage::new(service.store().unwrap().clone())
        .await
        .unwrap();
    service
        .register(greeting_filter("devnet", None, storage.clone()).unwrap())
        .unwrap();
    (service, storage)
}

#[tokio::test]
async fn single_greeting_is_indexed_after_one_cycle() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(MemoryChain::new());
    chain.push_block(0, vec![greeting_changed(0x1, "hi", true, Some(42))]);

    let (mut service, storage) = service_with_greetings(&dir, chain, Some(0)).await;
    let mut status = service.subscribe_status();

    assert!(service.start().await);
    status.wait_for(|s| s.cursor == Some(0)).await.unwrap();
    assert!(service.stop().await);

    let json = serde_json::to_value(storage.indexed_data().await.unwrap()).unwrap();
    assert_eq!(json["total"], 1);
    let event = &json["events"][0];
    assert_eq!(event["id"], 1);
    assert_eq!(event["greeting_setter"], "0x1");
    assert_eq!(event["greeting"], "hi");
    assert_eq!(event["premium"], 1);
    assert_eq!(event["value"], 42);
    assert!(!event["timestamp"].as_str().unwrap().is_empty());

    let raw = service
        .get_indexed_data(storage.schema())
        .await
        .unwrap();
    assert_eq!(raw.total, 1);
}

#[tokio::test]
async fn restart_resumes_after_last_committed_block() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(MemoryChain::new());
    chain.push_block(0, vec![greeting_changed(0x1, "gm", false, None)]);
    chain.push_block(1, vec![greeting_changed(0x2, "gn", true, Some(7))]);

    {
        let (mut service, _) = service_with_greetings(&dir, chain.clone(), None).await;
        let mut status = service.subscribe_status();
        assert!(service.start().await);
        status.wait_for(|s| s.cursor == Some(1)).await.unwrap();
        assert!(service.shutdown().await);
    }

    chain.push_block(2, vec![greeting_changed(0x3, "gg", false, None)]);
    let fetched_before = chain.fetched_blocks().len();

    let (mut service, storage) = service_with_greetings(&dir, chain.clone(), None).await;
    let mut status = service.subscribe_status();
    assert!(service.start().await);
    status.wait_for(|s| s.cursor == Some(2)).await.unwrap();
    assert!(service.stop().await);

    let refetched: Vec<u64> = chain.fetched_blocks()[fetched_before..].to_vec();
    assert!(refetched.iter().all(|block| *block >= 2), "refetched {refetched:?}");

    let data = storage.indexed_data().await.unwrap();
    let greetings: Vec<_> = data
        .events
        .iter()
        .map(|row| (row.id, row.greeting.clone().unwrap()))
        .collect();
    assert_eq!(
        greetings,
        vec![(1, "gm".to_string()), (2, "gn".to_string()), (3, "gg".to_string())]
    );
}

#[tokio::test]
async fn replaying_a_block_does_not_duplicate_rows() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(MemoryChain::new());
    chain.push_block(
        4,
        vec![
            greeting_changed(0x1, "a", false, None),
            greeting_changed(0x1, "b", false, Some(1)),
        ],
    );

    let (service, storage) = service_with_greetings(&dir, chain.clone(), None).await;
    let engine_db = EngineDb::new(service.store().unwrap().pool().clone())
        .await
        .unwrap();
    let engine = SyncEngine::new(
        chain,
        Arc::new(service.registry().clone()),
        engine_db,
        SyncEngineConfig::from(service.config()),
    );

    engine.sync_block(4).await.unwrap();
    assert_eq!(storage.count().await.unwrap(), 2);

    engine.sync_block(4).await.unwrap();
    assert_eq!(storage.count().await.unwrap(), 2);
}

#[tokio::test]
async fn foreign_contract_events_are_ignored() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(MemoryChain::new());
    let foreign = RawLog {
        from_address: Felt::from(0xbad_u64),
        ..greeting_changed(0x1, "spoof", true, Some(1))
    };
    chain.push_block(0, vec![foreign, greeting_changed(0x1, "real", false, None)]);

    let (mut service, storage) = service_with_greetings(&dir, chain, Some(0)).await;
    let mut status = service.subscribe_status();
    assert!(service.start().await);
    status.wait_for(|s| s.cursor == Some(0)).await.unwrap();
    assert!(service.stop().await);

    let data = storage.indexed_data().await.unwrap();
    assert_eq!(data.total, 1);
    assert_eq!(data.events[0].greeting.as_deref(), Some("real"));
}

#[tokio::test]
async fn address_override_replaces_manifest_address() {
    let dir = TempDir::new().unwrap();
    let store = auco::RecordStore::open(dir.path().join("indexer.db"))
        .await
        .unwrap();
    let storage = GreetingStorage::new(store).await.unwrap();

    let filter = greeting_filter("devnet", Some(Felt::from(0x123_u64)), storage.clone()).unwrap();
    assert_eq!(filter.contract_address(), Felt::from(0x123_u64));

    let mut registry = HandlerRegistry::new();
    registry.register(filter).unwrap();
    let duplicate = greeting_filter("devnet", Some(Felt::from(0x123_u64)), storage).unwrap();
    assert!(registry.register(duplicate).is_err());
    assert_eq!(registry.len(), 1);
}
