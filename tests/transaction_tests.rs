/// Transaction tests
///
/// Tests for explicit transactions (BEGIN, COMMIT, ROLLBACK) and lock release
/// Run with: cargo test --test transaction_tests

use std::time::Duration;
use tallydb::{ConnectionConfig, ConnectionPool, DbError, ResourceId};

async fn pool_with(resource: ResourceId, total: u64) -> ConnectionPool {
    let pool = ConnectionPool::new(ConnectionConfig::new().max_connections(4))
        .await
        .unwrap();
    let mut conn = pool.get_connection().await.unwrap();
    conn.connection().create_resource(resource, total).await.unwrap();
    conn.close().await.unwrap();
    pool
}

#[tokio::test]
async fn test_transaction_begin_commit() {
    let pool = pool_with(ResourceId(1), 5).await;
    let mut conn = pool.get_connection().await.unwrap();

    assert!(conn.begin().await.is_ok());
    assert!(conn.connection().is_in_transaction());

    let total = conn.connection().lock_and_read(ResourceId(1)).await.unwrap();
    conn.connection().write(ResourceId(1), total + 10).await.unwrap();

    // Not visible to readers before commit
    assert_eq!(pool.store().get(ResourceId(1)).await.unwrap(), 5);

    assert!(conn.commit().await.is_ok());
    assert!(!conn.connection().is_in_transaction());
    assert_eq!(pool.store().get(ResourceId(1)).await.unwrap(), 15);
    assert_eq!(pool.store().row(ResourceId(1)).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_transaction_begin_rollback() {
    let pool = pool_with(ResourceId(1), 5).await;
    let mut conn = pool.get_connection().await.unwrap();

    conn.begin().await.unwrap();
    conn.connection().lock_and_read(ResourceId(1)).await.unwrap();
    conn.connection().write(ResourceId(1), 500).await.unwrap();
    assert!(pool.store().lock_manager().is_locked(ResourceId(1)).unwrap());

    conn.rollback().await.unwrap();

    assert_eq!(pool.store().get(ResourceId(1)).await.unwrap(), 5);
    assert!(!pool.store().lock_manager().is_locked(ResourceId(1)).unwrap());
}

#[tokio::test]
async fn test_transaction_reads_its_own_writes() {
    let pool = pool_with(ResourceId(1), 0).await;
    let mut conn = pool.get_connection().await.unwrap();

    conn.begin().await.unwrap();
    conn.connection().lock_and_read(ResourceId(1)).await.unwrap();
    conn.connection().write(ResourceId(1), 7).await.unwrap();
    assert_eq!(conn.connection().lock_and_read(ResourceId(1)).await.unwrap(), 7);
    conn.commit().await.unwrap();

    assert_eq!(pool.store().get(ResourceId(1)).await.unwrap(), 7);
}

#[tokio::test]
async fn test_write_without_lock_is_rejected() {
    let pool = pool_with(ResourceId(1), 0).await;
    let mut conn = pool.get_connection().await.unwrap();

    conn.begin().await.unwrap();
    let result = conn.connection().write(ResourceId(1), 3).await;
    assert!(matches!(result, Err(DbError::LockNotHeld(ResourceId(1)))));
    conn.rollback().await.unwrap();
}

#[tokio::test]
async fn test_dropped_guard_rolls_back_and_releases_lock() {
    let pool = pool_with(ResourceId(1), 0).await;

    {
        let mut conn = pool.get_connection().await.unwrap();
        conn.begin().await.unwrap();
        conn.connection().lock_and_read(ResourceId(1)).await.unwrap();
        conn.connection().write(ResourceId(1), 99).await.unwrap();
        // Dropped without commit
    }

    assert_eq!(pool.store().get(ResourceId(1)).await.unwrap(), 0);
    assert!(!pool.store().lock_manager().is_locked(ResourceId(1)).unwrap());

    let stats = pool.store().stats().unwrap();
    assert_eq!(stats.active, 0);
    assert!(stats.aborted >= 1);
}

#[tokio::test]
async fn test_rollback_without_transaction_fails() {
    let pool = pool_with(ResourceId(1), 0).await;
    let mut conn = pool.get_connection().await.unwrap();

    assert!(conn.rollback().await.is_err());
    assert!(conn.commit().await.is_err());
}

#[tokio::test]
async fn test_delete_waits_for_lock_holder() {
    let pool = pool_with(ResourceId(1), 0).await;

    let mut holder = pool.get_connection().await.unwrap();
    holder.begin().await.unwrap();
    holder.connection().lock_and_read(ResourceId(1)).await.unwrap();

    let mut deleter = pool.get_connection().await.unwrap();
    let blocked = tokio::time::timeout(
        Duration::from_millis(30),
        deleter.connection().delete_resource(ResourceId(1)),
    )
    .await;
    assert!(blocked.is_err(), "delete ran while the row was locked");

    holder.connection().write(ResourceId(1), 4).await.unwrap();
    holder.commit().await.unwrap();

    deleter.connection().delete_resource(ResourceId(1)).await.unwrap();
    assert!(matches!(
        pool.store().get(ResourceId(1)).await,
        Err(DbError::ResourceNotFound(_))
    ));
}

#[tokio::test]
async fn test_checkouts_beyond_pool_size_still_run_transactions() {
    let pool = pool_with(ResourceId(1), 0).await;
    let mut conn = pool.get_connection().await.unwrap();
    conn.connection().create_resource(ResourceId(2), 0).await.unwrap();
    conn.close().await.unwrap();

    // Fill every parked slot with an open transaction holding resource 1
    let mut holders = vec![];
    for _ in 0..pool.config().max_connections {
        let mut holder = pool.get_connection().await.unwrap();
        holder.begin().await.unwrap();
        holders.push(holder);
    }
    holders[0].connection().lock_and_read(ResourceId(1)).await.unwrap();

    let mut extra = pool.get_connection().await.unwrap();
    extra.begin().await.unwrap();
    let total = extra.connection().lock_and_read(ResourceId(2)).await.unwrap();
    extra.connection().write(ResourceId(2), total + 1).await.unwrap();
    extra.commit().await.unwrap();

    assert_eq!(pool.store().get(ResourceId(2)).await.unwrap(), 1);
}
