//! Transfer Example
//!
//! Moves money between accounts inside a retried transaction, against the
//! in-memory mock backends. Shows:
//! - A transient commit failure retried transparently
//! - A permanent work error that rolls back and stops
//! - A retry hook for observability
//! - Caller cancellation cutting a backoff short
//!
//! Run with: cargo run --example transfer

use std::time::{Duration, Instant};

use futures::FutureExt;
use txretry::testing::{transient_error, MockConnection, MockPool, MockTx};
use txretry::{execute, Executor, RetryConfig, TxContext, TxError};

#[derive(Debug)]
struct InsufficientFunds {
    wanted: u64,
    available: u64,
}

impl std::fmt::Display for InsufficientFunds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "insufficient funds: wanted {}, available {}",
            self.wanted, self.available
        )
    }
}

impl std::error::Error for InsufficientFunds {}

fn transfer(
    tx: &mut MockTx,
    from: u32,
    to: u32,
    amount: u64,
    available: u64,
) -> Result<u64, InsufficientFunds> {
    if amount > available {
        return Err(InsufficientFunds {
            wanted: amount,
            available,
        });
    }
    tx.write(format!("debit account {} by {}", from, amount));
    tx.write(format!("credit account {} by {}", to, amount));
    Ok(available - amount)
}

// ==================== Transient Commit ====================

async fn example_transient_commit() {
    println!("\n=== Example 1: Serialization Conflict on Commit ===");

    let pool = MockPool::new();
    pool.fail_commit(transient_error());

    let config = RetryConfig::default().with_initial_backoff(Duration::from_millis(10));
    let result = execute(&TxContext::new(), &pool, &config, |tx| {
        async move { transfer(tx, 1, 2, 40, 100) }.boxed()
    })
    .await;

    match result {
        Ok(balance) => println!("Committed, remaining balance {}", balance),
        Err(e) => println!("Failed: {}", e),
    }
    println!("Stats: {:?}", pool.stats());
    println!("Committed writes: {:?}", pool.committed());
}

// ==================== Permanent Work Error ====================

async fn example_permanent_work_error() {
    println!("\n=== Example 2: Business Rule Violation ===");

    let pool = MockPool::new();
    let result = execute(&TxContext::new(), &pool, &RetryConfig::default(), |tx| {
        async move { transfer(tx, 1, 2, 500, 100) }.boxed()
    })
    .await;

    match result {
        Ok(balance) => println!("Committed, remaining balance {}", balance),
        Err(e @ TxError::Work { .. }) => println!("Rolled back, not retried: {}", e),
        Err(e) => println!("Unexpected failure: {}", e),
    }
    println!("Stats: {:?}", pool.stats());
}

// ==================== Retry Hook ====================

async fn example_retry_hook() {
    println!("\n=== Example 3: Observing Retries ===");

    let conn = MockConnection::new();
    conn.fail_begin(transient_error())
        .fail_begin(transient_error());

    let executor = Executor::new().on_retry(|event| {
        println!(
            "  attempt {} failed during {} ({}), retrying in {:?}",
            event.attempt, event.phase, event.error, event.next_delay
        );
    });
    let config = RetryConfig::default().with_initial_backoff(Duration::from_millis(10));

    let result = executor
        .execute(&TxContext::new(), &conn, &config, |tx| {
            async move { transfer(tx, 3, 4, 10, 10) }.boxed()
        })
        .await;

    println!("Result: {:?}", result.map_err(|e| e.to_string()));
    println!("Stats: {:?}", conn.stats());
}

// ==================== Cancellation ====================

async fn example_cancellation() {
    println!("\n=== Example 4: Cancelling During Backoff ===");

    let pool = MockPool::new();
    pool.fail_begin_always(transient_error());
    let config = RetryConfig::default()
        .with_max_retries(10)
        .with_initial_backoff(Duration::from_secs(1));
    let ctx = TxContext::new();

    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            println!("  cancelling");
            ctx.cancel();
        });
    }

    let start = Instant::now();
    let result = execute(&ctx, &pool, &config, |tx| {
        async move { transfer(tx, 1, 2, 1, 1) }.boxed()
    })
    .await;

    match result {
        Err(e) if e.is_cancelled() => {
            println!("Stopped after {:?}: {}", start.elapsed(), e)
        }
        other => println!("Unexpected: {:?}", other.map_err(|e| e.to_string())),
    }
    println!("Begin calls: {}", pool.stats().begins);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("======================================");
    println!("          Transfer Example            ");
    println!("======================================");

    example_transient_commit().await;
    example_permanent_work_error().await;
    example_retry_hook().await;
    example_cancellation().await;

    println!("\n======================================");
    println!("           Examples Complete           ");
    println!("======================================");
}
