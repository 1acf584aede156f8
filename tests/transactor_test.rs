//! Integration tests for the transaction manager.
//!
//! Each test runs against its own file-backed SQLite database so that the
//! transaction and the pool use distinct connections.

use db_transactor::config::{PoolConfig, TransactorConfig};
use db_transactor::db::{ConnContainer, Session, Transactor, TransactorStats, execute, query_one};
use db_transactor::error::DbError;
use db_transactor::params;
use sqlx::{FromRow, Sqlite};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("boom")]
    Boom,
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, FromRow)]
struct Count {
    n: i64,
}

struct TestDb {
    _dir: TempDir,
    conns: ConnContainer<Sqlite>,
    transactor: Transactor<Sqlite>,
}

/// Helper to setup a fresh database with an `items` table
async fn setup() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("tx.db").display());
    let conns = ConnContainer::<Sqlite>::connect(&url, None, &PoolConfig::default())
        .await
        .unwrap();
    execute(
        &Session::new(),
        &conns,
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
        &[],
    )
    .await
    .unwrap();
    let transactor = Transactor::new(conns.primary_pool().clone(), TransactorConfig::default());
    TestDb {
        _dir: dir,
        conns,
        transactor,
    }
}

/// Committed rows, as seen from a pooled connection outside any transaction.
async fn committed_count(db: &TestDb) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM items")
        .fetch_one(db.conns.replica())
        .await
        .unwrap()
}

async fn insert(session: &Session<Sqlite>, conns: &ConnContainer<Sqlite>, name: &str) -> Result<u64, DbError> {
    execute(session, conns, "INSERT INTO items (name) VALUES ($1)", &params![name]).await
}

fn explode(message: &str) {
    panic!("{}", message);
}

// =========================================================================
// Owner: commit and rollback
// =========================================================================

#[tokio::test]
async fn test_commit_on_success() {
    let db = setup().await;
    let conns = db.conns.clone();

    let affected = db
        .transactor
        .exec(&Session::new(), |tx| async move {
            assert!(tx.in_transaction());
            insert(&tx, &conns, "first").await
        })
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(committed_count(&db).await, 1);
    assert_eq!(
        db.transactor.stats(),
        TransactorStats {
            begun: 1,
            committed: 1,
            rolled_back: 0,
            commit_failed: 0,
            panics_recovered: 0,
        }
    );
}

#[tokio::test]
async fn test_rollback_on_error_returns_original_error() {
    let db = setup().await;
    let conns = db.conns.clone();

    let result: Result<(), AppError> = db
        .transactor
        .exec(&Session::new(), |tx| async move {
            insert(&tx, &conns, "doomed").await?;
            Err(AppError::Boom)
        })
        .await;

    assert!(matches!(result, Err(AppError::Boom)));
    assert_eq!(committed_count(&db).await, 0);
    let stats = db.transactor.stats();
    assert_eq!(stats.begun, 1);
    assert_eq!(stats.committed, 0);
    assert_eq!(stats.rolled_back, 1);
}

#[tokio::test]
async fn test_work_sees_its_own_writes() {
    let db = setup().await;
    let conns = db.conns.clone();

    let (inside, outside) = db
        .transactor
        .exec(&Session::new(), |tx| async move {
            insert(&tx, &conns, "visible").await?;
            let inside: Count =
                query_one(&tx, &conns, "SELECT COUNT(*) AS n FROM items", &[]).await?;
            let outside = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM items")
                .fetch_one(conns.replica())
                .await
                .map_err(DbError::from)?;
            Ok::<_, DbError>((inside.n, outside))
        })
        .await
        .unwrap();

    assert_eq!(inside, 1);
    // uncommitted writes are invisible to other connections
    assert_eq!(outside, 0);
    assert_eq!(committed_count(&db).await, 1);
}

#[tokio::test]
async fn test_duplicate_key_rolls_back_whole_unit() {
    let db = setup().await;
    let conns = db.conns.clone();

    let result = db
        .transactor
        .exec(&Session::new(), |tx| async move {
            insert(&tx, &conns, "same").await?;
            insert(&tx, &conns, "same").await
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_duplicate_key(), "unexpected error: {err}");
    assert!(err.driver_error().is_some());
    assert_eq!(committed_count(&db).await, 0);
}

// =========================================================================
// Participant: nested exec joins the outer transaction
// =========================================================================

#[tokio::test]
async fn test_nested_exec_joins_outer_transaction() {
    let db = setup().await;
    let conns = db.conns.clone();
    let transactor = db.transactor.clone();

    let result: Result<(), AppError> = db
        .transactor
        .exec(&Session::new(), |outer| async move {
            let outer_id = outer.transaction_id().map(str::to_owned);
            let inner_conns = conns.clone();
            let inner_id = transactor
                .exec(&outer, |inner| async move {
                    insert(&inner, &inner_conns, "nested").await?;
                    Ok::<_, DbError>(inner.transaction_id().map(str::to_owned))
                })
                .await?;
            assert_eq!(inner_id, outer_id);

            // the participant returned without committing
            let outside = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM items")
                .fetch_one(conns.replica())
                .await
                .map_err(DbError::from)?;
            assert_eq!(outside, 0);

            Err(AppError::Boom)
        })
        .await;

    assert!(matches!(result, Err(AppError::Boom)));
    // the owner's rollback discarded the participant's write
    assert_eq!(committed_count(&db).await, 0);
    let stats = db.transactor.stats();
    assert_eq!(stats.begun, 1);
    assert_eq!(stats.rolled_back, 1);
    assert_eq!(stats.committed, 0);
}

#[tokio::test]
async fn test_participant_error_propagates_to_owner() {
    let db = setup().await;
    let conns = db.conns.clone();
    let transactor = db.transactor.clone();

    let result: Result<(), AppError> = db
        .transactor
        .exec(&Session::new(), |outer| async move {
            insert(&outer, &conns, "outer").await?;
            transactor
                .exec(&outer, |_inner| async move { Err::<(), _>(AppError::Boom) })
                .await?;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(AppError::Boom)));
    assert_eq!(committed_count(&db).await, 0);
    assert_eq!(db.transactor.stats().begun, 1);
}

#[tokio::test]
async fn test_nested_success_commits_once() {
    let db = setup().await;
    let conns = db.conns.clone();
    let transactor = db.transactor.clone();

    db.transactor
        .exec(&Session::new(), |outer| async move {
            insert(&outer, &conns, "a").await?;
            let inner_conns = conns.clone();
            transactor
                .exec(&outer, |inner| async move { insert(&inner, &inner_conns, "b").await })
                .await?;
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

    assert_eq!(committed_count(&db).await, 2);
    let stats = db.transactor.stats();
    assert_eq!(stats.begun, 1);
    assert_eq!(stats.committed, 1);
}

#[tokio::test]
async fn test_rollback_of_transaction_ended_by_work_keeps_original_error() {
    let db = setup().await;
    let conns = db.conns.clone();

    let result = db
        .transactor
        .exec(&Session::new(), |tx| async move {
            insert(&tx, &conns, "committed by hand").await?;
            execute(&tx, &conns, "COMMIT", &[]).await?;
            Err::<(), DbError>(DbError::invalid_input("rejected after commit"))
        })
        .await;

    // the server already ended the transaction, so the failed ROLLBACK is not
    // reported on top of the work's error
    match result {
        Err(DbError::InvalidInput { message }) => assert_eq!(message, "rejected after commit"),
        other => panic!("expected the original error, got {other:?}"),
    }
    assert_eq!(committed_count(&db).await, 1);
    assert_eq!(db.transactor.stats().rolled_back, 1);
}

#[tokio::test]
async fn test_failed_commit_is_commit_error() {
    let db = setup().await;
    let session = Session::new();
    execute(&session, &db.conns, "CREATE TABLE owners (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();
    execute(
        &session,
        &db.conns,
        "CREATE TABLE pets (
            id INTEGER PRIMARY KEY,
            owner_id INTEGER NOT NULL REFERENCES owners(id) DEFERRABLE INITIALLY DEFERRED
        )",
        &[],
    )
    .await
    .unwrap();
    let conns = db.conns.clone();

    // the deferred foreign key is only checked by COMMIT
    let result = db
        .transactor
        .exec(&session, |tx| async move {
            execute(&tx, &conns, "INSERT INTO pets (id, owner_id) VALUES ($1, $2)", &params![1, 404]).await
        })
        .await;

    match result {
        Err(DbError::Commit(sqlx::Error::Database(db_err))) => {
            assert!(db_err.message().contains("FOREIGN KEY"), "unexpected error: {db_err}");
        }
        other => panic!("expected a commit failure, got {other:?}"),
    }
    let stats = db.transactor.stats();
    assert_eq!(stats.committed, 0);
    assert_eq!(stats.commit_failed, 1);
    assert_eq!(stats.rolled_back, 0);

    let pets = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pets")
        .fetch_one(db.conns.replica())
        .await
        .unwrap();
    assert_eq!(pets, 0);
}

// =========================================================================
// Panic recovery
// =========================================================================

#[tokio::test]
async fn test_panic_while_polling_is_recovered_and_rolled_back() {
    let db = setup().await;
    let conns = db.conns.clone();

    let result: Result<(), AppError> = db
        .transactor
        .exec(&Session::new(), |tx| async move {
            insert(&tx, &conns, "before panic").await?;
            explode("explode while polling");
            Ok(())
        })
        .await;

    match result {
        Err(AppError::Db(DbError::PanicRecovered { message, stack })) => {
            assert_eq!(message, "explode while polling");
            assert!(!stack.is_empty());
        }
        other => panic!("expected a recovered panic, got {other:?}"),
    }
    assert_eq!(committed_count(&db).await, 0);
    let stats = db.transactor.stats();
    assert_eq!(stats.panics_recovered, 1);
    assert_eq!(stats.rolled_back, 1);
}

#[tokio::test]
async fn test_panic_before_future_is_built_is_recovered() {
    let db = setup().await;

    let result = db
        .transactor
        .exec(&Session::new(), |_tx| {
            explode("explode while building");
            async move { Ok::<(), DbError>(()) }
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, DbError::PanicRecovered { ref message, .. } if message == "explode while building"));
    assert_eq!(db.transactor.stats().rolled_back, 1);
}

#[tokio::test]
async fn test_participant_panic_is_recovered_as_error() {
    let db = setup().await;
    let conns = db.conns.clone();
    let transactor = db.transactor.clone();

    let result = db
        .transactor
        .exec(&Session::new(), |outer| async move {
            insert(&outer, &conns, "outer").await?;
            transactor
                .exec(&outer, |_inner| async move {
                    explode("inner explode");
                    Ok::<(), DbError>(())
                })
                .await
        })
        .await;

    assert!(matches!(result, Err(DbError::PanicRecovered { .. })));
    assert_eq!(committed_count(&db).await, 0);
    assert_eq!(db.transactor.stats().panics_recovered, 1);
}

// =========================================================================
// Handle lifecycle, deadlines and concurrency
// =========================================================================

#[tokio::test]
async fn test_session_outliving_transaction_is_rejected() {
    let db = setup().await;

    let leaked = db
        .transactor
        .exec(&Session::new(), |tx| async move { Ok::<_, DbError>(tx) })
        .await
        .unwrap();

    assert!(leaked.in_transaction());
    let err = insert(&leaked, &db.conns, "too late").await.unwrap_err();
    match err {
        DbError::Transaction {
            message,
            transaction_id,
        } => {
            assert_eq!(message, "Transaction is no longer active");
            assert_eq!(Some(transaction_id.as_str()), leaked.transaction_id());
        }
        other => panic!("expected a closed-transaction error, got {other:?}"),
    }
    assert_eq!(committed_count(&db).await, 0);
}

#[tokio::test]
async fn test_expired_deadline_fails_before_begin() {
    let db = setup().await;
    let session = Session::new().with_deadline(tokio::time::Instant::now() - Duration::from_millis(1));

    let result = db
        .transactor
        .exec(&session, |_tx| async move { Ok::<_, DbError>(()) })
        .await;

    assert!(matches!(result, Err(DbError::Timeout { .. })));
    assert_eq!(db.transactor.stats().begun, 0);
}

#[tokio::test]
async fn test_deadline_expiring_mid_query_returns_promptly() {
    let db = setup().await;
    let conns = db.conns.clone();
    let session = Session::new().with_timeout(Duration::from_millis(150));
    let started = std::time::Instant::now();

    // keeps the connection busy for far longer than the deadline
    let result = db
        .transactor
        .exec(&session, |tx| async move {
            query_one::<_, Count>(
                &tx,
                &conns,
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 200000000)
                 SELECT COUNT(*) AS n FROM c",
                &[],
            )
            .await
        })
        .await;

    assert!(
        matches!(result, Err(DbError::Timeout { ref operation }) if operation == "query execution"),
        "unexpected result: {result:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    let stats = db.transactor.stats();
    assert_eq!(stats.rolled_back, 1);
    assert_eq!(stats.committed, 0);
}

#[tokio::test]
async fn test_generous_deadline_commits() {
    let db = setup().await;
    let conns = db.conns.clone();
    let session = Session::new().with_timeout(Duration::from_secs(30));

    db.transactor
        .exec(&session, |tx| async move {
            assert!(tx.deadline().is_some());
            insert(&tx, &conns, "in time").await
        })
        .await
        .unwrap();

    assert_eq!(committed_count(&db).await, 1);
}

#[tokio::test]
async fn test_concurrent_sessions_get_distinct_transactions() {
    let db = setup().await;
    let mut handles = Vec::new();

    for _ in 0..4 {
        let transactor = db.transactor.clone();
        let conns = db.conns.clone();
        handles.push(tokio::spawn(async move {
            transactor
                .exec(&Session::new(), |tx| async move {
                    let one: Count = query_one(&tx, &conns, "SELECT 1 AS n", &[]).await?;
                    assert_eq!(one.n, 1);
                    Ok::<_, DbError>(tx.transaction_id().map(str::to_owned))
                })
                .await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let id = handle.await.unwrap().unwrap().expect("transaction id");
        assert!(id.starts_with("tx_"));
        ids.insert(id);
    }
    assert_eq!(ids.len(), 4);
    assert_eq!(db.transactor.stats().committed, 4);
}

#[tokio::test]
async fn test_sequential_exec_on_same_session_are_independent() {
    let db = setup().await;
    let session = Session::new();
    let conns = db.conns.clone();

    let _ = db
        .transactor
        .exec(&session, |tx| async move {
            insert(&tx, &conns, "kept").await?;
            Ok::<_, DbError>(())
        })
        .await;

    let conns = db.conns.clone();
    let result: Result<(), AppError> = db
        .transactor
        .exec(&session, |tx| async move {
            insert(&tx, &conns, "dropped").await?;
            Err(AppError::Boom)
        })
        .await;

    assert!(result.is_err());
    // the session never carried a transaction, so each exec owned its own
    assert!(!session.in_transaction());
    assert_eq!(committed_count(&db).await, 1);
    assert_eq!(db.transactor.stats().begun, 2);
}
