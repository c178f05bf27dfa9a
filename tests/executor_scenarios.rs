//! End-to-end scenarios for the transactional retry loop.
//!
//! Every scenario runs against both backend shapes so the executor is shown
//! to behave the same whether it drives a pool or a single connection.

use futures::FutureExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use txretry::testing::{
    permanent_error, transient_error, MockConnection, MockPool, MockStats, MockTx,
};
use txretry::{
    execute, CancelReason, Executor, Phase, ResourceAdapter, RetryConfig, SqlStateError, TxContext,
    TxError,
};

/// The bits of a mock backend the scenarios inspect.
trait Backend: ResourceAdapter<Tx = MockTx> {
    fn make() -> Self;
    fn stats(&self) -> MockStats;
}

impl Backend for MockPool {
    fn make() -> Self {
        MockPool::new()
    }
    fn stats(&self) -> MockStats {
        MockPool::stats(self)
    }
}

impl Backend for MockConnection {
    fn make() -> Self {
        MockConnection::new()
    }
    fn stats(&self) -> MockStats {
        MockConnection::stats(self)
    }
}

fn fast_config(max_retries: u32) -> RetryConfig {
    RetryConfig::default()
        .with_max_retries(max_retries)
        .with_initial_backoff(Duration::from_millis(1))
        .with_max_backoff(Duration::from_millis(4))
}

fn assert_all_finalized(stats: MockStats) {
    assert_eq!(
        stats.opened,
        stats.commits + stats.rollbacks,
        "every opened transaction is ended exactly once: {:?}",
        stats
    );
    assert_eq!(stats.abandoned, 0, "no handle was dropped: {:?}", stats);
}

// ============================================================================
// Concrete scenarios
// ============================================================================

async fn begin_always_transient<B: Backend>(script: impl Fn(&B)) {
    let backend = B::make();
    script(&backend);

    let err = execute(&TxContext::new(), &backend, &fast_config(2), |_tx| {
        async { Ok::<_, SqlStateError>(()) }.boxed()
    })
    .await
    .unwrap_err();

    match err {
        TxError::RetryExhausted {
            phase, attempts, ..
        } => {
            assert_eq!(phase, Phase::Begin);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    let stats = backend.stats();
    assert_eq!(stats.begins, 3);
    assert_eq!(stats.opened, 0);
}

#[tokio::test]
async fn begin_always_transient_exhausts_after_three_attempts() {
    begin_always_transient::<MockPool>(|p| {
        p.fail_begin_always(transient_error());
    })
    .await;
    begin_always_transient::<MockConnection>(|c| {
        c.fail_begin_always(transient_error());
    })
    .await;
}

async fn permanent_work_error<B: Backend>() {
    let backend = B::make();
    let calls = AtomicU32::new(0);

    let err = execute(&TxContext::new(), &backend, &fast_config(3), |tx| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tx.write("partial");
            Err::<(), _>(permanent_error())
        }
        .boxed()
    })
    .await
    .unwrap_err();

    match &err {
        TxError::Work { source, rollback } => {
            assert!(source.to_string().contains("23505"));
            assert!(rollback.is_none());
        }
        other => panic!("expected Work error, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = backend.stats();
    assert_eq!(stats.begins, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.commits, 0);
    assert_all_finalized(stats);
}

#[tokio::test]
async fn permanent_work_error_rolls_back_once() {
    permanent_work_error::<MockPool>().await;
    permanent_work_error::<MockConnection>().await;
}

async fn transient_commit_then_success<B: Backend>(fail: impl Fn(&B)) {
    let backend = B::make();
    fail(&backend);

    let result = execute(&TxContext::new(), &backend, &fast_config(3), |tx| {
        async move {
            tx.write("transfer");
            Ok::<_, SqlStateError>(())
        }
        .boxed()
    })
    .await;

    assert!(result.is_ok());
    let stats = backend.stats();
    assert_eq!(stats.begins, 2);
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.rollbacks, 0);
    assert_all_finalized(stats);
}

#[tokio::test]
async fn transient_commit_failure_retries_without_rollback() {
    transient_commit_then_success::<MockPool>(|p| {
        p.fail_commit(transient_error());
    })
    .await;
    transient_commit_then_success::<MockConnection>(|c| {
        c.fail_commit(transient_error());
    })
    .await;
}

#[tokio::test]
async fn cancel_during_backoff_returns_promptly() {
    let pool = MockPool::new();
    pool.fail_begin(transient_error());
    let config = RetryConfig::default()
        .with_initial_backoff(Duration::from_millis(200))
        .with_max_backoff(Duration::from_millis(200));
    let ctx = TxContext::new();

    let canceller = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel();
        })
    };

    let start = Instant::now();
    let err = execute(&ctx, &pool, &config, |_tx| {
        async { Ok::<_, SqlStateError>(()) }.boxed()
    })
    .await
    .unwrap_err();
    let elapsed = start.elapsed();
    canceller.await.unwrap();

    assert!(
        elapsed < Duration::from_millis(150),
        "returned after {:?}, expected well before the 200ms backoff ended",
        elapsed
    );
    match err {
        TxError::Cancelled {
            phase,
            reason,
            last_error,
        } => {
            assert_eq!(phase, Phase::Backoff);
            assert_eq!(reason, CancelReason::Cancelled);
            let last = last_error.expect("transient begin error is kept");
            assert!(last.to_string().contains("40001"));
        }
        other => panic!("expected Cancelled, got {:?}", other),
    }
    assert_eq!(pool.stats().begins, 1);
}

// ============================================================================
// Properties on concrete inputs
// ============================================================================

#[tokio::test]
async fn permanent_error_in_any_phase_stops_immediately() {
    let begin = MockPool::new();
    begin.fail_begin(permanent_error());
    let commit = MockPool::new();
    commit.fail_commit(permanent_error());

    for (pool, expected) in [(begin, Phase::Begin), (commit, Phase::Commit)] {
        let err = execute(&TxContext::new(), &pool, &fast_config(5), |_tx| {
            async { Ok::<_, SqlStateError>(()) }.boxed()
        })
        .await
        .unwrap_err();

        assert_eq!(err.phase(), expected);
        assert!(!err.is_retry_exhausted());
        assert_eq!(pool.stats().begins, 1);
        assert_all_finalized(pool.stats());
    }
}

#[tokio::test]
async fn cancelled_backoff_makes_no_further_attempts() {
    let conn = MockConnection::new();
    conn.fail_begin_always(transient_error());
    let ctx = TxContext::new();
    let config = RetryConfig::default()
        .with_max_retries(10)
        .with_initial_backoff(Duration::from_secs(1));

    let run = execute(&ctx, &conn, &config, |_tx| {
        async { Ok::<_, SqlStateError>(()) }.boxed()
    });
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
    };
    let (result, ()) = tokio::join!(run, cancel);

    assert!(result.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(conn.stats().begins, 1);
}

#[tokio::test]
async fn independent_resources_commit_independently() {
    let first = MockPool::new();
    let second = MockPool::new();
    let calls = AtomicU32::new(0);
    let config = RetryConfig::default();

    for pool in [&first, &second] {
        let id = execute(&TxContext::new(), pool, &config, |tx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tx.write("row");
                Ok::<_, SqlStateError>(tx.id())
            }
            .boxed()
        })
        .await
        .unwrap();
        assert_eq!(id, 1);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    for pool in [&first, &second] {
        assert_eq!(pool.stats().begins, 1);
        assert_eq!(pool.stats().commits, 1);
        assert_eq!(pool.committed(), vec!["row".to_string()]);
    }
}

#[tokio::test]
async fn mixed_failures_leave_no_open_transactions() {
    let conn = MockConnection::new();
    conn.fail_begin(transient_error())
        .fail_commit(transient_error())
        .fail_rollback(SqlStateError::new("08006", "connection failure"));
    let calls = AtomicU32::new(0);

    let result = execute(&TxContext::new(), &conn, &fast_config(5), |tx| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tx.write(format!("attempt {}", n));
            if n == 1 {
                Err(transient_error())
            } else {
                Ok(n)
            }
        }
        .boxed()
    })
    .await;

    // begin fails, commit fails, work fails (rollback fails too), then success
    assert_eq!(result.unwrap(), 2);
    let stats = conn.stats();
    assert_eq!(stats.begins, 4);
    assert_all_finalized(stats);
    assert_eq!(conn.open_transactions(), 0);
    assert_eq!(conn.committed(), vec!["attempt 2".to_string()]);
}

// ============================================================================
// Sharing
// ============================================================================

#[tokio::test]
async fn one_executor_serves_concurrent_calls() {
    let pool = MockPool::new();
    pool.fail_commit(transient_error())
        .fail_commit(transient_error());
    let executor = Arc::new(Executor::new());
    let config = fast_config(5);

    let runs = (0..8).map(|i| {
        let executor = Arc::clone(&executor);
        let pool = pool.clone();
        let config = config.clone();
        async move {
            executor
                .execute(&TxContext::new(), &pool, &config, |tx| {
                    async move {
                        tx.write(format!("job {}", i));
                        Ok::<_, SqlStateError>(i)
                    }
                    .boxed()
                })
                .await
        }
    });
    let results = futures::future::join_all(runs).await;

    assert!(results.iter().all(|r| r.is_ok()));
    let stats = pool.stats();
    assert_eq!(stats.begins, 10);
    assert_eq!(stats.commits, 10);
    assert_all_finalized(stats);
    assert_eq!(pool.committed().len(), 8);
}

#[tokio::test]
async fn shared_connection_runs_attempts_one_at_a_time() {
    let conn = MockConnection::new().with_latency(Duration::from_millis(2));
    let config = fast_config(2);

    let runs = (0..4).map(|i| {
        let conn = conn.clone();
        let config = config.clone();
        async move {
            execute(&TxContext::new(), &conn, &config, |tx| {
                async move {
                    tx.write(format!("job {}", i));
                    Ok::<_, SqlStateError>(())
                }
                .boxed()
            })
            .await
        }
    });
    let results = futures::future::join_all(runs).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(conn.committed().len(), 4);
    assert_all_finalized(conn.stats());
}

// ============================================================================
// Abandoned transactions
// ============================================================================

#[tokio::test]
async fn dropped_execute_does_not_leak_into_next_commit() {
    let conn = MockConnection::new();
    let config = fast_config(2);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        execute(&TxContext::new(), &conn, &config, |tx| {
            async move {
                tx.write("debit without credit");
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SqlStateError>(())
            }
            .boxed()
        }),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(conn.stats().abandoned, 1);

    execute(&TxContext::new(), &conn, &config, |tx| {
        async move {
            tx.write("next caller");
            Ok::<_, SqlStateError>(())
        }
        .boxed()
    })
    .await
    .unwrap();

    assert_eq!(conn.committed(), vec!["next caller".to_string()]);
    assert_eq!(conn.stats().recovered, 1);
}

#[tokio::test]
async fn cut_off_commit_is_cleaned_up_by_next_begin() {
    let conn = MockConnection::new();
    conn.hang_commit();
    let config = fast_config(2).with_attempt_timeout(Some(Duration::from_millis(20)));

    let err = execute(&TxContext::new(), &conn, &config, |tx| {
        async move {
            tx.write("first");
            Ok::<_, SqlStateError>(())
        }
        .boxed()
    })
    .await
    .unwrap_err();
    assert!(err.is_commit_outcome_unknown());
    assert_eq!(conn.stats().begins, 1);

    execute(&TxContext::new(), &conn, &config, |tx| {
        async move {
            tx.write("second");
            Ok::<_, SqlStateError>(())
        }
        .boxed()
    })
    .await
    .unwrap();

    assert_eq!(conn.committed(), vec!["second".to_string()]);
    assert_eq!(conn.stats().recovered, 1);
}
