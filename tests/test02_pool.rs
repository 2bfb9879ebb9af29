use std::sync::Arc;
use std::time::Duration;

use sql_taskpool::prelude::*;
use sql_taskpool::test_utils::MockDriver;

const SHORT: Duration = Duration::from_millis(10);

fn pool_with(driver: &MockDriver, options: PoolOptions) -> Result<Arc<Pool>, SqlTaskpoolError> {
    let write = ConnectionConfig::new("db-primary", "app", "", "main");
    let reads = vec![ConnectionConfig::new("db-replica", "app", "", "main")];
    let builder = Arc::new(ConnectorBuilder::new(Arc::new(driver.clone()), write, reads));
    Ok(Arc::new(Pool::new(builder, options)?))
}

#[tokio::test]
async fn checked_out_connectors_are_exclusive_and_reused() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let pool = pool_with(&driver, PoolOptions::default().with_size(4))?;

    let a = pool.acquire(Role::Write).await?;
    let b = pool.acquire(Role::Write).await?;
    let r = pool.acquire(Role::Read).await?;
    assert_eq!(pool.live_counts(), PoolCounts { read: 1, write: 2 });
    assert_eq!(pool.counts(), PoolCounts::default());
    assert_eq!(driver.connects(), 3);

    pool.release(a).await;
    pool.release(b).await;
    pool.release(r).await;
    assert_eq!(pool.counts(), PoolCounts { read: 1, write: 2 });

    let again = pool.acquire(Role::Write).await?;
    assert_eq!(driver.connects(), 3, "idle connector should be reused");
    assert_eq!(pool.counts().write, 1);
    pool.release(again).await;
    Ok(())
}

#[tokio::test]
async fn unhealthy_connector_is_closed_on_release() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let pool = pool_with(&driver, PoolOptions::default().with_max_exec_count(1))?;

    let mut conn = pool.acquire(Role::Write).await?;
    conn.execute("update t set a = 1", &[], SHORT)
        .await
        .map_err(|e| SqlTaskpoolError::ExecutionError(e.to_string()))?;
    pool.release(conn).await;

    assert_eq!(driver.closes(), 1);
    assert_eq!(pool.counts().write, 0);
    assert_eq!(pool.live_counts().write, 0);
    Ok(())
}

#[tokio::test]
async fn stale_idle_connector_is_recycled_on_acquire() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let pool = pool_with(
        &driver,
        PoolOptions::default().with_max_idle(Duration::from_millis(20)),
    )?;

    let conn = pool.acquire(Role::Write).await?;
    pool.release(conn).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let conn = pool.acquire(Role::Write).await?;
    assert_eq!(driver.connects(), 2);
    assert_eq!(driver.closes(), 1);
    assert_eq!(pool.live_counts().write, 1);
    pool.release(conn).await;
    Ok(())
}

#[tokio::test]
async fn repeated_wait_timeouts_turn_fatal() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let options = PoolOptions::default()
        .with_size(1)
        .with_ceiling_factor(1)
        .with_max_wait_timeouts(2)
        .with_timeouts(SHORT, SHORT);
    let pool = pool_with(&driver, options)?;

    let held = pool.acquire(Role::Write).await?;

    for expected in 1..=3 {
        let err = pool.acquire(Role::Write).await.unwrap_err();
        assert!(
            matches!(err, SqlTaskpoolError::PoolExhaustedTimeout(Role::Write)),
            "{err}"
        );
        assert!(err.is_retryable());
        assert_eq!(pool.consecutive_timeouts(), expected);
    }

    let err = pool.acquire(Role::Write).await.unwrap_err();
    assert!(matches!(err, SqlTaskpoolError::PoolFatal(_)), "{err}");
    assert!(!err.is_retryable());

    pool.release(held).await;
    let conn = pool.acquire(Role::Write).await?;
    assert_eq!(pool.consecutive_timeouts(), 0);
    pool.release(conn).await;
    Ok(())
}

#[tokio::test]
async fn too_many_connections_waits_for_a_returned_connector() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let options = PoolOptions::default()
        .with_size(2)
        .with_ceiling_factor(1)
        .with_timeouts(SHORT, Duration::from_millis(500));
    let pool = pool_with(&driver, options)?;

    let held = pool.acquire(Role::Write).await?;
    driver.fail_connect(1040);

    let returner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pool.release(held).await;
        })
    };

    let conn = pool.acquire(Role::Write).await?;
    returner.await.map_err(|e| SqlTaskpoolError::ExecutionError(e.to_string()))?;
    assert_eq!(driver.connects(), 1);
    assert_eq!(pool.live_counts().write, 1);
    pool.release(conn).await;
    Ok(())
}

#[tokio::test]
async fn refused_connection_with_nothing_to_wait_for_surfaces_the_driver_error()
-> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let pool = pool_with(&driver, PoolOptions::default().with_timeouts(SHORT, SHORT))?;
    driver.fail_connect(1040);

    let err = pool.acquire(Role::Write).await.unwrap_err();
    assert_eq!(err.code(), Some(1040));
    assert_eq!(pool.live_counts().write, 0);

    driver.fail_connect(1045);
    let err = pool.acquire(Role::Write).await.unwrap_err();
    assert!(matches!(err, SqlTaskpoolError::Connection { code: 1045, .. }));
    assert_eq!(pool.consecutive_timeouts(), 1);
    Ok(())
}

#[tokio::test]
async fn read_without_replicas_has_no_connector() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let write = ConnectionConfig::new("db-primary", "app", "", "main");
    let builder = Arc::new(ConnectorBuilder::new(Arc::new(driver), write, vec![]));
    let pool = Pool::new(builder, PoolOptions::default())?;

    let err = pool.acquire(Role::Read).await.unwrap_err();
    assert!(matches!(err, SqlTaskpoolError::NoConnector(Role::Read)));
    assert_eq!(pool.live_counts().read, 0);
    Ok(())
}

#[tokio::test]
async fn lost_connection_is_retried_once() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let pool = pool_with(&driver, PoolOptions::default())?;

    let mut conn = pool.acquire(Role::Write).await?;
    driver.lose_connection_once();
    let result = conn.execute("update t set a = 1", &[], SHORT).await;
    assert!(result.is_ok());
    assert_eq!(conn.last_error_code(), 0);
    assert_eq!(driver.connects(), 2);
    assert_eq!(driver.statements().len(), 2);
    pool.release(conn).await;
    Ok(())
}

#[tokio::test]
async fn closed_pool_refuses_and_closes_returned_connectors() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let pool = pool_with(&driver, PoolOptions::default())?;

    let idle = pool.acquire(Role::Write).await?;
    let busy = pool.acquire(Role::Write).await?;
    pool.release(idle).await;

    pool.close().await;
    assert_eq!(pool.status(), PoolStatus::Closed);
    assert_eq!(driver.closes(), 1);
    assert!(matches!(
        pool.acquire(Role::Write).await,
        Err(SqlTaskpoolError::PoolClosed)
    ));

    pool.release(busy).await;
    assert_eq!(driver.closes(), 2);
    assert_eq!(pool.live_counts().write, 0);
    Ok(())
}

#[tokio::test]
async fn registry_shares_pools_for_identical_configs() -> Result<(), SqlTaskpoolError> {
    let driver: Arc<dyn Driver> = Arc::new(MockDriver::new());
    let registry = Registry::new();
    let replica_a = ConnectionConfig::new("replica-a", "app", "", "main");
    let replica_b = ConnectionConfig::new("replica-b", "app", "", "main");
    let write = ConnectionConfig::new("primary", "app", "", "main");

    let first = registry.builder(
        Arc::clone(&driver),
        write.clone(),
        vec![replica_a.clone(), replica_b.clone()],
    );
    let second = registry.builder(Arc::clone(&driver), write.clone(), vec![replica_b, replica_a]);
    assert!(Arc::ptr_eq(&first, &second));

    let pool = registry.pool(&first, PoolOptions::default().with_size(3))?;
    let same = registry.pool(&second, PoolOptions::default().with_size(9))?;
    assert!(Arc::ptr_eq(&pool, &same));
    assert_eq!(same.options().size, 3);

    let other = registry.builder(driver, write.with_port(3307), vec![]);
    assert!(!Arc::ptr_eq(&first, &other));
    registry.pool(&other, PoolOptions::default())?;
    assert_eq!(registry.pool_count(), 2);

    registry.close_all().await;
    assert_eq!(registry.pool_count(), 0);
    assert_eq!(pool.status(), PoolStatus::Closed);
    Ok(())
}
