//! Integration tests for sessions over a SQLite file.
//!
//! Tests verify that:
//! - Work done in a session disappears when the session closes
//! - Every session sees the same generated row ids
//! - A second lease waits for the first, and honors cancellation
//! - Session transactions commit and roll back as savepoints

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use txsession::db::{Connector, LeaseContext, SessionFactory, SqlxConnector, SqlxDriver};
use txsession::models::{DatabaseType, QueryParam};
use txsession::DbError;

/// Create a SQLite database file with a `users` table.
async fn setup_db() -> String {
    let temp_file = NamedTempFile::new().unwrap();
    // Keep the temp file alive - prevent deletion when function returns
    let db_path = temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let url = format!("sqlite:{}", db_path);

    let connector = SqlxConnector::new(&url).unwrap();
    let mut conn = connector.connect().await.unwrap();
    conn.execute(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
        &[],
    )
    .await
    .unwrap();
    conn.close().await.unwrap();

    url
}

async fn factory_for(url: &str) -> SessionFactory {
    let driver = Arc::new(SqlxDriver::new(DatabaseType::SQLite));
    SessionFactory::from_driver(driver, url).await.unwrap()
}

#[tokio::test]
async fn test_session_work_is_discarded_on_close() {
    let url = setup_db().await;
    let factory = factory_for(&url).await;

    let db = factory.lease(&LeaseContext::background()).await.unwrap();
    db.execute("INSERT INTO users (name) VALUES ('alice')")
        .await
        .unwrap();
    let count = db
        .fetch_scalar("SELECT COUNT(*) AS n FROM users", &[])
        .await
        .unwrap();
    assert_eq!(count, json!(1));
    db.close().await.unwrap();

    let db = factory.lease(&LeaseContext::background()).await.unwrap();
    let count = db
        .fetch_scalar("SELECT COUNT(*) AS n FROM users", &[])
        .await
        .unwrap();
    assert_eq!(count, json!(0));
    db.close().await.unwrap();

    factory.close().await.unwrap();
}

#[tokio::test]
async fn test_every_session_generates_the_same_id() {
    let url = setup_db().await;
    let factory = factory_for(&url).await;

    for _ in 0..10 {
        let db = factory.lease(&LeaseContext::background()).await.unwrap();
        let result = db
            .execute_with(
                "INSERT INTO users (name) VALUES (?)",
                &[QueryParam::from("bob")],
            )
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, Some(1));
        db.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_second_lease_waits_until_timeout() {
    let url = setup_db().await;
    let factory = factory_for(&url).await;

    let first = factory.lease(&LeaseContext::background()).await.unwrap();

    let ctx = LeaseContext::with_timeout(Duration::from_millis(50));
    let err = factory.lease(&ctx).await.unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));

    // The session was not consumed by the cancelled lease
    first.close().await.unwrap();
    let ctx = LeaseContext::with_timeout(Duration::from_secs(5));
    let second = factory.lease(&ctx).await.unwrap();
    assert_eq!(second.generation().await.unwrap(), 2);
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_context_keeps_ready_session() {
    let url = setup_db().await;
    let factory = factory_for(&url).await;

    let token = CancellationToken::new();
    token.cancel();
    let err = factory
        .lease(&LeaseContext::with_token(token))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));

    let db = factory.lease(&LeaseContext::background()).await.unwrap();
    assert_eq!(db.generation().await.unwrap(), 1);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_waiting_lease_resumes_after_close() {
    let url = setup_db().await;
    let factory = Arc::new(factory_for(&url).await);

    let first = factory.lease(&LeaseContext::background()).await.unwrap();
    first
        .execute("INSERT INTO users (name) VALUES ('carol')")
        .await
        .unwrap();

    let waiter = {
        let factory = factory.clone();
        tokio::spawn(async move {
            let ctx = LeaseContext::with_timeout(Duration::from_secs(5));
            let db = factory.lease(&ctx).await?;
            let count = db
                .fetch_scalar("SELECT COUNT(*) AS n FROM users", &[])
                .await?;
            db.close().await?;
            Ok::<_, DbError>(count)
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    first.close().await.unwrap();

    let count = waiter.await.unwrap().unwrap();
    assert_eq!(count, json!(0));
}

#[tokio::test]
async fn test_cancel_token_while_waiting() {
    let url = setup_db().await;
    let factory = Arc::new(factory_for(&url).await);
    let first = factory.lease(&LeaseContext::background()).await.unwrap();

    let token = CancellationToken::new();
    let waiter = {
        let factory = factory.clone();
        let ctx = LeaseContext::with_token(token.clone());
        tokio::spawn(async move { factory.lease(&ctx).await.map(|_| ()) })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));

    first.close().await.unwrap();
}

#[tokio::test]
async fn test_committed_transaction_visible_until_close() {
    let url = setup_db().await;
    let factory = factory_for(&url).await;
    let db = factory.lease(&LeaseContext::background()).await.unwrap();

    let mut tx = db.begin().await.unwrap();
    tx.execute("INSERT INTO users (name) VALUES ('dave')")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let rows = db.fetch_all("SELECT name FROM users").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("dave"));
    db.close().await.unwrap();

    let db = factory.lease(&LeaseContext::background()).await.unwrap();
    assert!(db.fetch_all("SELECT name FROM users").await.unwrap().is_empty());
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_rolled_back_transaction_keeps_earlier_work() {
    let url = setup_db().await;
    let factory = factory_for(&url).await;
    let db = factory.lease(&LeaseContext::background()).await.unwrap();

    db.execute("INSERT INTO users (name) VALUES ('erin')")
        .await
        .unwrap();

    let mut tx = db.begin().await.unwrap();
    tx.execute("DELETE FROM users").await.unwrap();
    let inside = tx.fetch_all("SELECT id FROM users").await.unwrap();
    assert!(inside.is_empty());
    tx.rollback().await.unwrap();

    let row = db
        .fetch_one("SELECT id, name FROM users WHERE name = ?", &[QueryParam::from("erin")])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["id"], json!(1));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_transaction_is_rolled_back() {
    let url = setup_db().await;
    let factory = factory_for(&url).await;
    let db = factory.lease(&LeaseContext::background()).await.unwrap();

    {
        let mut tx = db.begin().await.unwrap();
        tx.execute("INSERT INTO users (name) VALUES ('frank')")
            .await
            .unwrap();
    }

    let count = db
        .fetch_scalar("SELECT COUNT(*) AS n FROM users", &[])
        .await
        .unwrap();
    assert_eq!(count, json!(0));

    // A new transaction can start once the abandoned one is gone
    let tx = db.begin().await.unwrap();
    tx.commit().await.unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_statement_error_keeps_session_usable() {
    let url = setup_db().await;
    let factory = factory_for(&url).await;
    let db = factory.lease(&LeaseContext::background()).await.unwrap();

    let err = db.execute("INSERT INTO missing_table VALUES (1)").await;
    assert!(matches!(err, Err(DbError::Database { .. })));

    db.ping().await.unwrap();
    db.close().await.unwrap();

    let db = factory.lease(&LeaseContext::background()).await.unwrap();
    db.ping().await.unwrap();
    db.close().await.unwrap();
}
