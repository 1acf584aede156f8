//! Query execution.
//!
//! Generic typed query functions. Each call resolves its executor through
//! [`ConnContainer::primary`] (so it joins the session's transaction if there
//! is one), logs the SQL and its timing in the session span, honors the
//! session deadline, and classifies driver failures into [`DbError`](crate::error::DbError) kinds.

use crate::db::backend::Backend;
use crate::db::params::{NamedQuery, QueryParam};
use crate::db::pool::{Conn, ConnContainer};
use crate::db::session::Session;
use crate::error::{DbResult, classify};
use futures_util::future::BoxFuture;
use serde::Serialize;
use sqlx::FromRow;
use std::time::Instant;
use tracing::{debug, warn};

/// Fetch exactly one row mapped to `T`.
///
/// Returns [`DbError::NotFound`](crate::error::DbError::NotFound) if the query matches no rows.
pub async fn query_one<DB, T>(
    session: &Session<DB>,
    conns: &ConnContainer<DB>,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<T>
where
    DB: Backend,
    T: for<'r> FromRow<'r, DB::Row> + Send + Unpin,
{
    run(session, conns, sql, params.len(), |conn| DB::fetch_one(conn, sql, params)).await
}

/// Fetch every row mapped to `T`, preserving result order. No rows is an
/// empty `Vec`, not an error.
pub async fn query_many<DB, T>(
    session: &Session<DB>,
    conns: &ConnContainer<DB>,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<Vec<T>>
where
    DB: Backend,
    T: for<'r> FromRow<'r, DB::Row> + Send + Unpin,
{
    run(session, conns, sql, params.len(), |conn| DB::fetch_all(conn, sql, params)).await
}

/// Like [`query_many`], with `:name` placeholders bound from the fields of `args`.
pub async fn named_query_many<DB, T, A>(
    session: &Session<DB>,
    conns: &ConnContainer<DB>,
    sql: &str,
    args: &A,
) -> DbResult<Vec<T>>
where
    DB: Backend,
    T: for<'r> FromRow<'r, DB::Row> + Send + Unpin,
    A: Serialize + ?Sized,
{
    let query = NamedQuery::parse(sql);
    let params = query.bind_args(args)?;
    query_many(session, conns, &query.sql, &params).await
}

/// Run a statement and return the number of rows affected.
pub async fn execute<DB>(
    session: &Session<DB>,
    conns: &ConnContainer<DB>,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<u64>
where
    DB: Backend,
{
    run(session, conns, sql, params.len(), |conn| DB::execute(conn, sql, params)).await
}

async fn run<'a, DB, T, F>(
    session: &'a Session<DB>,
    conns: &'a ConnContainer<DB>,
    sql: &str,
    param_count: usize,
    query: F,
) -> DbResult<T>
where
    DB: Backend,
    F: FnOnce(Conn<'a, DB>) -> BoxFuture<'a, Result<T, sqlx::Error>>,
{
    session.check_deadline("query execution")?;
    let conn = session
        .bounded("query execution", conns.primary(session))
        .await??;

    let span = session.span();
    debug!(parent: span, query = %sql, params = param_count, "SQL query start");
    let start = Instant::now();

    let result = session.bounded("query execution", query(conn)).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(value)) => {
            debug!(parent: span, query = %sql, elapsed_ms, "SQL query finished");
            Ok(value)
        }
        Ok(Err(e)) => {
            let err = classify(e);
            // NotFound is an expected outcome for lookups
            if err.is_not_found() {
                debug!(parent: span, query = %sql, elapsed_ms, "SQL query returned no rows");
            } else {
                warn!(parent: span, query = %sql, elapsed_ms, error = %err, "SQL query failed");
            }
            Err(err)
        }
        Err(timeout) => {
            warn!(parent: span, query = %sql, elapsed_ms, "SQL query exceeded the session deadline");
            Err(timeout)
        }
    }
}
