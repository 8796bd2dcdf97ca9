//! Runs against a real database. Set IBC_TEST_DATABASE_URL and run with
//! `--ignored`.

use ibconnect::config::{DatabaseConfig, PubSubConfig};
use ibconnect::coordination::{LockManager, RetryPolicy, ShutdownToken};
use ibconnect::domain::FencingToken;
use ibconnect::{CoordinationStore, IbcError, PostgresStore, PubSubBus};
use std::sync::Arc;
use std::time::Duration;

async fn store() -> Arc<PostgresStore> {
    let url = std::env::var("IBC_TEST_DATABASE_URL").expect("IBC_TEST_DATABASE_URL not set");
    let config = DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    };
    let store = PostgresStore::new(&config).await.unwrap();
    store.migrate().await.unwrap();
    Arc::new(store)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "needs IBC_TEST_DATABASE_URL"]
async fn lock_is_exclusive_and_fenced() {
    let store = store().await;
    let locks = LockManager::new(store.clone(), RetryPolicy::default());
    let name = unique("lock");
    let ttl = Duration::from_secs(2);

    let a = locks.acquire(&name, "A", ttl).await.unwrap();
    assert_eq!(a.fencing_token, FencingToken(1));
    assert!(matches!(
        locks.acquire(&name, "B", ttl).await,
        Err(IbcError::LockHeld { .. })
    ));

    tokio::time::sleep(Duration::from_millis(2_200)).await;
    let b = locks.acquire(&name, "B", ttl).await.unwrap();
    assert_eq!(b.fencing_token, FencingToken(2));

    let err = store
        .renew_lock(&name, "A", FencingToken(1), ttl)
        .await
        .unwrap_err();
    assert!(err.is_ownership_loss());

    locks.release(&b).await.unwrap();
    let record = locks.inspect(&name).await.unwrap().unwrap();
    assert_eq!(record.holder_id, None);
    assert_eq!(record.fencing_token, FencingToken(2));
}

#[tokio::test]
#[ignore = "needs IBC_TEST_DATABASE_URL"]
async fn messages_resume_from_acked_cursor() {
    let store = store().await;
    let bus = PubSubBus::new(store, PubSubConfig::default(), RetryPolicy::default());
    let channel = unique("orders");
    let never = ShutdownToken::never();

    assert_eq!(bus.publish(&channel, b"m1").await.unwrap(), 1);
    assert_eq!(bus.publish(&channel, b"m2").await.unwrap(), 2);

    let mut sub = bus.subscribe(&channel, "S", 0).await.unwrap();
    let m1 = sub.next(&never).await.unwrap().unwrap();
    assert_eq!(m1.payload, b"m1");
    sub.ack(m1.sequence_id).await.unwrap();
    drop(sub);

    let mut resumed = bus.subscribe(&channel, "S", 0).await.unwrap();
    let m2 = resumed.next(&never).await.unwrap().unwrap();
    assert_eq!((m2.sequence_id, m2.payload.as_slice()), (2, &b"m2"[..]));

    assert!(bus.unsubscribe(&channel, "S").await.unwrap());
}
