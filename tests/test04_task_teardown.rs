use std::sync::Arc;
use std::time::Duration;

use sql_taskpool::prelude::*;
use sql_taskpool::test_utils::MockDriver;

const SETTLE: Duration = Duration::from_millis(50);

fn manager(driver: &MockDriver) -> Result<Arc<TransactionManager>, SqlTaskpoolError> {
    let write = ConnectionConfig::new("db-primary", "app", "", "main");
    let builder = Arc::new(ConnectorBuilder::new(Arc::new(driver.clone()), write, vec![]));
    let pool = Arc::new(Pool::new(builder, PoolOptions::default().with_size(8))?);
    Ok(Arc::new(TransactionManager::new(pool)))
}

#[tokio::test]
async fn finished_task_with_open_transaction_is_rolled_back() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;

    let task = {
        let tx = Arc::clone(&tx);
        spawn(async move {
            tx.begin(Role::Write, false).await?;
            tx.command("insert into t (a) values (?)", &[1.into()]).await?;
            Ok::<_, SqlTaskpoolError>(())
        })
    };
    task.await
        .map_err(|e| SqlTaskpoolError::ExecutionError(e.to_string()))??;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(driver.rollbacks(), 1);
    assert_eq!(driver.commits(), 0);
    let pool = tx.pool();
    assert_eq!(pool.live_counts().write, 1);
    assert_eq!(pool.counts().write, 1);
    Ok(())
}

#[tokio::test]
async fn aborted_tasks_give_their_connectors_back() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;

    let handles: Vec<_> = (0..5_i64)
        .map(|i| {
            let tx = Arc::clone(&tx);
            spawn(async move {
                tx.begin(Role::Write, false).await?;
                tx.command("update t set a = ? where id = ?", &[1.into(), RowValues::Int(i)])
                    .await?;
                tokio::time::sleep(Duration::from_secs(30)).await;
                tx.commit(false).await
            })
        })
        .collect();

    tokio::time::sleep(SETTLE).await;
    assert_eq!(tx.pool().live_counts().write, 5);
    assert_eq!(tx.pool().counts().write, 0);

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        assert!(handle.await.unwrap_err().is_cancelled());
    }
    tokio::time::sleep(SETTLE).await;

    assert_eq!(driver.rollbacks(), 5);
    assert_eq!(driver.commits(), 0);
    assert_eq!(tx.pool().counts().write, 5);
    assert_eq!(tx.pool().live_counts().write, 5);
    Ok(())
}

#[tokio::test]
async fn abandoned_implicit_transaction_is_released_without_rollback()
-> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;

    let task = {
        let tx = Arc::clone(&tx);
        spawn(async move {
            tx.begin(Role::Write, true).await?;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, SqlTaskpoolError>(())
        })
    };
    tokio::time::sleep(SETTLE).await;
    task.abort();
    let _ = task.await;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(driver.begins(), 0);
    assert_eq!(driver.rollbacks(), 0);
    assert_eq!(tx.pool().counts().write, 1);
    Ok(())
}

#[tokio::test]
async fn abort_during_a_statement_frees_the_pool_slot() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;
    driver.set_delay(Duration::from_secs(30));

    let task = {
        let tx = Arc::clone(&tx);
        spawn(async move { tx.command("update t set a = 1", &[]).await })
    };
    tokio::time::sleep(SETTLE).await;
    assert_eq!(tx.pool().live_counts().write, 1);

    task.abort();
    let _ = task.await;
    tokio::time::sleep(SETTLE).await;

    // The connector was in flight, so it is dropped rather than reused.
    assert_eq!(tx.pool().live_counts().write, 0);
    assert_eq!(tx.pool().counts().write, 0);
    Ok(())
}

#[tokio::test]
async fn panicking_task_is_rolled_back() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;

    let task = {
        let tx = Arc::clone(&tx);
        spawn(async move {
            tx.begin(Role::Write, false).await?;
            if tx.is_running()? {
                panic!("handler bug");
            }
            Ok::<_, SqlTaskpoolError>(())
        })
    };
    assert!(task.await.unwrap_err().is_panic());
    tokio::time::sleep(SETTLE).await;

    assert_eq!(driver.rollbacks(), 1);
    assert_eq!(tx.pool().counts().write, 1);
    Ok(())
}

#[tokio::test]
async fn committed_task_needs_no_teardown() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;

    task_scope(async {
        tx.begin(Role::Write, false).await?;
        tx.command("delete from t where id = ?", &[9.into()]).await?;
        tx.commit(false).await
    })
    .await?;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(driver.commits(), 1);
    assert_eq!(driver.rollbacks(), 0);
    assert_eq!(tx.pool().counts().write, 1);
    Ok(())
}

#[tokio::test]
async fn timed_out_implicit_command_leaves_the_task_idle() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;

    task_scope(async {
        driver.set_delay(Duration::from_secs(5));
        let timed_out = tokio::time::timeout(SETTLE, tx.command("update t set a = 1", &[])).await;
        assert!(timed_out.is_err());
        assert!(!tx.is_running()?);
        assert_eq!(tx.model(None)?, Role::Write);
        assert_ne!(tx.last_error_code()?, 0);
        assert_eq!(tx.pool().live_counts().write, 0);

        driver.set_delay(Duration::ZERO);
        tx.command("update t set a = 2", &[]).await?;
        assert_eq!(tx.last_error_code()?, 0);
        assert!(!tx.is_running()?);
        Ok::<_, SqlTaskpoolError>(())
    })
    .await?;

    assert_eq!(tx.pool().counts().write, 1);
    assert_eq!(tx.pool().live_counts().write, 1);
    Ok(())
}

#[tokio::test]
async fn explicit_transaction_recovers_after_a_timed_out_statement() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;

    task_scope(async {
        tx.begin(Role::Write, false).await?;
        driver.set_delay(Duration::from_secs(5));
        let timed_out = tokio::time::timeout(SETTLE, tx.command("update t set a = 1", &[])).await;
        assert!(timed_out.is_err());
        assert!(tx.is_running()?);
        driver.set_delay(Duration::ZERO);

        let err = tx.command("update t set a = 2", &[]).await.unwrap_err();
        assert!(matches!(err, SqlTaskpoolError::ExecutionError(_)), "{err}");

        let err = tx.rollback().await.unwrap_err();
        assert_eq!(err.code(), Some(2013));
        assert!(!tx.is_running()?);
        assert_eq!(tx.last_error_code()?, 2013);

        // Nothing left to end.
        tx.commit(false).await?;
        tx.command("update t set a = 3", &[]).await?;
        assert!(!tx.is_running()?);
        Ok::<_, SqlTaskpoolError>(())
    })
    .await?;

    assert_eq!(driver.commits(), 0);
    assert_eq!(tx.pool().counts().write, 1);
    assert_eq!(tx.pool().live_counts().write, 1);
    Ok(())
}

#[tokio::test]
async fn commit_after_a_timed_out_statement_reports_the_lost_work() -> Result<(), SqlTaskpoolError> {
    let driver = MockDriver::new();
    let tx = manager(&driver)?;

    task_scope(async {
        tx.begin(Role::Write, false).await?;
        driver.set_delay(Duration::from_secs(5));
        let _ = tokio::time::timeout(SETTLE, tx.command("update t set a = 1", &[])).await;

        let err = tx.commit(false).await.unwrap_err();
        assert!(matches!(err, SqlTaskpoolError::Statement { code: 2013, .. }));
        assert!(!tx.is_running()?);
        assert_eq!(tx.model(None)?, Role::Write);
        Ok::<_, SqlTaskpoolError>(())
    })
    .await?;

    assert_eq!(driver.commits(), 0);
    Ok(())
}
