//! Database backends.
//!
//! The data-access layer is generic over [`Backend`], a thin extension of
//! `sqlx::Database` that knows how to begin, finish and query through either a
//! pooled connection or an open transaction. Every method returns a boxed
//! `Send` future so generic callers never have to prove sendness themselves.
//!
//! # Architecture
//!
//! Implementations live in per-database submodules:
//! - `postgres`: PostgreSQL, the production target
//! - `sqlite`: SQLite, for embedded use and self-contained tests
//!
//! Each submodule provides identical functionality adapted to the database's type system.

use crate::config::TransactorConfig;
use crate::db::pool::Conn;
use crate::db::QueryParam;
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use sqlx::{Database, FromRow, Pool, Transaction};

/// A database the transactor and query executor can drive.
pub trait Backend: Database {
    /// Which backend this is, for logging and dispatch.
    const KIND: BackendKind;

    /// Statement run immediately after `BEGIN` to apply isolation level and
    /// access mode, if the backend supports setting them per transaction.
    fn transaction_preamble(config: &TransactorConfig) -> Option<String>;

    /// Start a transaction on `pool` and run `preamble` inside it.
    fn begin<'a>(
        pool: &'a Pool<Self>,
        preamble: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Transaction<'static, Self>, sqlx::Error>>;

    fn commit(tx: Transaction<'static, Self>) -> BoxFuture<'static, Result<(), sqlx::Error>>;

    fn rollback(tx: Transaction<'static, Self>) -> BoxFuture<'static, Result<(), sqlx::Error>>;

    /// True if a rollback failed only because the transaction had already
    /// ended on the server, e.g. after the work issued its own `COMMIT`.
    fn is_transaction_inactive(err: &sqlx::Error) -> bool;

    /// Check that a pooled connection can reach the server.
    fn ping(pool: &Pool<Self>) -> BoxFuture<'_, Result<(), sqlx::Error>>;

    /// Fetch exactly one row mapped to `T`. Zero rows is `RowNotFound`.
    fn fetch_one<'a, T>(
        conn: Conn<'a, Self>,
        sql: &'a str,
        params: &'a [QueryParam],
    ) -> BoxFuture<'a, Result<T, sqlx::Error>>
    where
        T: for<'r> FromRow<'r, Self::Row> + Send + Unpin + 'a;

    /// Fetch every row mapped to `T`, in result order.
    fn fetch_all<'a, T>(
        conn: Conn<'a, Self>,
        sql: &'a str,
        params: &'a [QueryParam],
    ) -> BoxFuture<'a, Result<Vec<T>, sqlx::Error>>
    where
        T: for<'r> FromRow<'r, Self::Row> + Send + Unpin + 'a;

    /// Run a statement and return the number of rows affected.
    fn execute<'a>(
        conn: Conn<'a, Self>,
        sql: &'a str,
        params: &'a [QueryParam],
    ) -> BoxFuture<'a, Result<u64, sqlx::Error>>;
}

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Postgres,
    Sqlite,
}

impl BackendKind {
    /// Detect the backend from a connection URL scheme.
    pub fn from_url(url: &str) -> DbResult<Self> {
        let lower = url.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if lower.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            Err(DbError::invalid_input(
                "Unsupported database URL: expected a postgres://, postgresql:// or sqlite: scheme",
            ))
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod postgres {
    use super::*;
    use sqlx::encode::{Encode, IsNull};
    use sqlx::error::BoxDynError;
    use sqlx::postgres::types::Oid;
    use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo};
    use sqlx::{Connection, Postgres};

    /// SQLSTATE `no_active_sql_transaction`.
    const PG_NO_ACTIVE_TRANSACTION: &str = "25P01";

    /// Sent with parameter type OID 0 so the server infers the type of a NULL
    /// from where it is used. A typed NULL (e.g. `None::<String>`) is `text`
    /// and is rejected by columns of any other type.
    pub(super) struct UntypedNull;

    impl sqlx::Type<Postgres> for UntypedNull {
        fn type_info() -> PgTypeInfo {
            PgTypeInfo::with_oid(Oid(0))
        }
    }

    impl Encode<'_, Postgres> for UntypedNull {
        fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
            Ok(IsNull::Yes)
        }
    }

    impl Backend for Postgres {
        const KIND: BackendKind = BackendKind::Postgres;

        fn transaction_preamble(config: &TransactorConfig) -> Option<String> {
            let mut modes = Vec::new();
            if let Some(level) = config.isolation.as_sql() {
                modes.push(format!("ISOLATION LEVEL {level}"));
            }
            if config.read_only {
                modes.push("READ ONLY".to_string());
            }
            if modes.is_empty() {
                None
            } else {
                Some(format!("SET TRANSACTION {}", modes.join(", ")))
            }
        }

        fn begin<'a>(
            pool: &'a Pool<Self>,
            preamble: Option<&'a str>,
        ) -> BoxFuture<'a, Result<Transaction<'static, Self>, sqlx::Error>> {
            Box::pin(async move {
                let mut tx = pool.begin().await?;
                if let Some(sql) = preamble {
                    // Unprepared: SET TRANSACTION must be the first statement.
                    sqlx::Executor::execute(&mut *tx, sql).await?;
                }
                Ok(tx)
            })
        }

        fn commit(tx: Transaction<'static, Self>) -> BoxFuture<'static, Result<(), sqlx::Error>> {
            Box::pin(tx.commit())
        }

        fn rollback(
            tx: Transaction<'static, Self>,
        ) -> BoxFuture<'static, Result<(), sqlx::Error>> {
            Box::pin(tx.rollback())
        }

        fn is_transaction_inactive(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(PG_NO_ACTIVE_TRANSACTION)
            )
        }

        fn ping(pool: &Pool<Self>) -> BoxFuture<'_, Result<(), sqlx::Error>> {
            Box::pin(async move {
                let mut conn = pool.acquire().await?;
                conn.ping().await
            })
        }

        fn fetch_one<'a, T>(
            conn: Conn<'a, Self>,
            sql: &'a str,
            params: &'a [QueryParam],
        ) -> BoxFuture<'a, Result<T, sqlx::Error>>
        where
            T: for<'r> FromRow<'r, Self::Row> + Send + Unpin + 'a,
        {
            Box::pin(async move {
                let query = crate::bind_params!(sqlx::query_as::<Self, T>(sql), params, null = UntypedNull);
                match conn {
                    Conn::Transaction(mut tx) => query.fetch_one(&mut *tx).await,
                    Conn::Pool(pool) => query.fetch_one(pool).await,
                }
            })
        }

        fn fetch_all<'a, T>(
            conn: Conn<'a, Self>,
            sql: &'a str,
            params: &'a [QueryParam],
        ) -> BoxFuture<'a, Result<Vec<T>, sqlx::Error>>
        where
            T: for<'r> FromRow<'r, Self::Row> + Send + Unpin + 'a,
        {
            Box::pin(async move {
                let query = crate::bind_params!(sqlx::query_as::<Self, T>(sql), params, null = UntypedNull);
                match conn {
                    Conn::Transaction(mut tx) => query.fetch_all(&mut *tx).await,
                    Conn::Pool(pool) => query.fetch_all(pool).await,
                }
            })
        }

        fn execute<'a>(
            conn: Conn<'a, Self>,
            sql: &'a str,
            params: &'a [QueryParam],
        ) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
            Box::pin(async move {
                let query = crate::bind_params!(sqlx::query::<Self>(sql), params, null = UntypedNull);
                let result = match conn {
                    Conn::Transaction(mut tx) => query.execute(&mut *tx).await?,
                    Conn::Pool(pool) => query.execute(pool).await?,
                };
                Ok(result.rows_affected())
            })
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::{Connection, Sqlite};

    impl Backend for Sqlite {
        const KIND: BackendKind = BackendKind::Sqlite;

        // SQLite transactions are always serializable and have no per-transaction
        // read-only mode.
        fn transaction_preamble(_config: &TransactorConfig) -> Option<String> {
            None
        }

        fn begin<'a>(
            pool: &'a Pool<Self>,
            preamble: Option<&'a str>,
        ) -> BoxFuture<'a, Result<Transaction<'static, Self>, sqlx::Error>> {
            Box::pin(async move {
                let mut tx = pool.begin().await?;
                if let Some(sql) = preamble {
                    sqlx::Executor::execute(&mut *tx, sql).await?;
                }
                Ok(tx)
            })
        }

        fn commit(tx: Transaction<'static, Self>) -> BoxFuture<'static, Result<(), sqlx::Error>> {
            Box::pin(tx.commit())
        }

        fn rollback(
            tx: Transaction<'static, Self>,
        ) -> BoxFuture<'static, Result<(), sqlx::Error>> {
            Box::pin(tx.rollback())
        }

        fn is_transaction_inactive(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err) if db_err.message().contains("no transaction is active")
            )
        }

        fn ping(pool: &Pool<Self>) -> BoxFuture<'_, Result<(), sqlx::Error>> {
            Box::pin(async move {
                let mut conn = pool.acquire().await?;
                conn.ping().await
            })
        }

        fn fetch_one<'a, T>(
            conn: Conn<'a, Self>,
            sql: &'a str,
            params: &'a [QueryParam],
        ) -> BoxFuture<'a, Result<T, sqlx::Error>>
        where
            T: for<'r> FromRow<'r, Self::Row> + Send + Unpin + 'a,
        {
            Box::pin(async move {
                let query = crate::bind_params!(
                    sqlx::query_as::<Self, T>(sql),
                    params,
                    null = None::<String>,
                    json_as_text
                );
                match conn {
                    Conn::Transaction(mut tx) => query.fetch_one(&mut *tx).await,
                    Conn::Pool(pool) => query.fetch_one(pool).await,
                }
            })
        }

        fn fetch_all<'a, T>(
            conn: Conn<'a, Self>,
            sql: &'a str,
            params: &'a [QueryParam],
        ) -> BoxFuture<'a, Result<Vec<T>, sqlx::Error>>
        where
            T: for<'r> FromRow<'r, Self::Row> + Send + Unpin + 'a,
        {
            Box::pin(async move {
                let query = crate::bind_params!(
                    sqlx::query_as::<Self, T>(sql),
                    params,
                    null = None::<String>,
                    json_as_text
                );
                match conn {
                    Conn::Transaction(mut tx) => query.fetch_all(&mut *tx).await,
                    Conn::Pool(pool) => query.fetch_all(pool).await,
                }
            })
        }

        fn execute<'a>(
            conn: Conn<'a, Self>,
            sql: &'a str,
            params: &'a [QueryParam],
        ) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
            Box::pin(async move {
                let query = crate::bind_params!(
                    sqlx::query::<Self>(sql),
                    params,
                    null = None::<String>,
                    json_as_text
                );
                let result = match conn {
                    Conn::Transaction(mut tx) => query.execute(&mut *tx).await?,
                    Conn::Pool(pool) => query.execute(pool).await?,
                };
                Ok(result.rows_affected())
            })
        }
    }
}
