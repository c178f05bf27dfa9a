//! Postgres Example
//!
//! Runs a retried transfer against a real Postgres database, once through a
//! connection pool and once on a single dedicated connection.
//!
//! Run with:
//!   DATABASE_URL=postgres://localhost/txretry \
//!     cargo run --example postgres_pool --features postgres

use std::time::Duration;

use futures::FutureExt;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::Connection;
use txretry::adapter::postgres::SharedConnection;
use txretry::{execute, Executor, RetryConfig, TxContext};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS accounts (
    id INT PRIMARY KEY,
    balance BIGINT NOT NULL CHECK (balance >= 0)
)";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect(&url)
        .await?;

    sqlx::query(SCHEMA).execute(&pool).await?;
    sqlx::query("INSERT INTO accounts (id, balance) VALUES (1, 100), (2, 0) ON CONFLICT DO NOTHING")
        .execute(&pool)
        .await?;

    let config = RetryConfig::default().with_attempt_timeout(Some(Duration::from_secs(5)));
    let ctx = TxContext::new().with_timeout(Duration::from_secs(30));

    // pool-based: every attempt checks out a fresh connection
    let executor = Executor::new().on_retry(|event| {
        tracing::info!(attempt = event.attempt, phase = %event.phase, "retrying transfer");
    });
    let balance: i64 = executor
        .execute(&ctx, &pool, &config, |tx| {
            async move {
                sqlx::query("UPDATE accounts SET balance = balance - 10 WHERE id = 1")
                    .execute(&mut **tx)
                    .await?;
                sqlx::query("UPDATE accounts SET balance = balance + 10 WHERE id = 2")
                    .execute(&mut **tx)
                    .await?;
                let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM accounts WHERE id = 1")
                    .fetch_one(&mut **tx)
                    .await?;
                Ok::<_, sqlx::Error>(balance)
            }
            .boxed()
        })
        .await?;
    println!("pool transfer committed, account 1 balance {}", balance);

    // connection-based: every transaction runs on the same connection
    let conn = SharedConnection::new(PgConnection::connect(&url).await?);
    let moved = execute(&ctx, &conn, &config, |tx| {
        async move {
            let result = sqlx::query("UPDATE accounts SET balance = balance - 10 WHERE id = 2")
                .execute(&mut **tx)
                .await?;
            Ok::<_, sqlx::Error>(result.rows_affected())
        }
        .boxed()
    })
    .await?;
    println!("connection transfer committed, {} row(s) updated", moved);

    pool.close().await;
    Ok(())
}
