//! Transaction manager.
//!
//! [`Transactor::exec`] runs a unit of work inside a transaction. The first
//! `exec` on a session becomes the transaction **owner**: it begins, hands the
//! work a child session carrying the transaction, and commits or rolls back
//! exactly once. Nested `exec` calls on a session that already carries a
//! transaction are **participants**: they run their work in the existing
//! transaction and leave finishing it to the owner.
//!
//! A panic inside the work, whether raised while building the future or while
//! polling it, is caught and reported as [`DbError::PanicRecovered`], so the
//! owner still rolls back.

use crate::config::TransactorConfig;
use crate::db::backend::Backend;
use crate::db::session::{Session, TxCell};
use crate::error::{DbError, DbResult};
use futures_util::FutureExt;
use serde::Serialize;
use sqlx::Pool;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Counters of transaction outcomes since the transactor was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactorStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    /// Commits that failed or ran past the session deadline. The database
    /// discards these transactions; no rollback is issued for them.
    pub commit_failed: u64,
    pub panics_recovered: u64,
}

#[derive(Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    commit_failed: AtomicU64,
    panics_recovered: AtomicU64,
}

/// Runs units of work inside transactions on the primary pool.
pub struct Transactor<DB: Backend> {
    pool: Pool<DB>,
    config: TransactorConfig,
    preamble: Option<String>,
    counters: Arc<Counters>,
}

impl<DB: Backend> Clone for Transactor<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            config: self.config,
            preamble: self.preamble.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<DB: Backend> std::fmt::Debug for Transactor<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactor")
            .field("backend", &DB::KIND)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<DB: Backend> Transactor<DB> {
    /// Create a transactor over `pool`. The configuration applies to every
    /// transaction it begins.
    pub fn new(pool: Pool<DB>, config: TransactorConfig) -> Self {
        Self {
            preamble: DB::transaction_preamble(&config),
            pool,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &TransactorConfig {
        &self.config
    }

    pub fn stats(&self) -> TransactorStats {
        TransactorStats {
            begun: self.counters.begun.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            commit_failed: self.counters.commit_failed.load(Ordering::Relaxed),
            panics_recovered: self.counters.panics_recovered.load(Ordering::Relaxed),
        }
    }

    /// Run `work` inside a transaction.
    ///
    /// If `session` already carries a transaction the work joins it and its
    /// result is returned unchanged. Otherwise a new transaction is begun,
    /// committed if the work succeeds and rolled back if it fails or panics.
    /// A rollback failure is reported as [`DbError::Rollback`], which keeps
    /// the work's error as its cause.
    pub async fn exec<R, E, F, Fut>(&self, session: &Session<DB>, work: F) -> Result<R, E>
    where
        F: FnOnce(Session<DB>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<DbError> + std::error::Error + Send + Sync + 'static,
    {
        if let Some(tx_id) = session.transaction_id() {
            debug!(parent: session.span(), transaction_id = %tx_id, "Joining active transaction");
            return self.run_guarded(session, session.clone(), work).await;
        }

        session.check_deadline("begin transaction")?;
        let tx = session
            .bounded("begin transaction", DB::begin(&self.pool, self.preamble.as_deref()))
            .await?
            .map_err(DbError::Begin)?;
        self.counters.begun.fetch_add(1, Ordering::Relaxed);

        let cell = Arc::new(TxCell::new(tx));
        let child = session.with_transaction(Arc::clone(&cell));
        debug!(
            parent: session.span(),
            transaction_id = %cell.id(),
            isolation = %self.config.isolation,
            read_only = self.config.read_only,
            "Transaction started"
        );

        let result = self.run_guarded(session, child, work).await;

        let Some(tx) = cell.close().await else {
            return Err(DbError::internal(format!(
                "transaction {} was closed before its owner finished",
                cell.id()
            ))
            .into());
        };

        match result {
            Err(err) => self.rollback(session, cell.id(), tx, err).await,
            Ok(value) => {
                self.commit(session, cell.id(), tx).await?;
                Ok(value)
            }
        }
    }

    /// Roll back after the work failed, returning the work's error unless the
    /// rollback itself failed.
    ///
    /// The rollback is bounded by the session deadline. Past the deadline it
    /// is abandoned: the transaction is dropped, and sqlx finishes the
    /// rollback in the background once the connection is released, so a
    /// statement still running on the server cannot hold up the caller.
    async fn rollback<R, E>(
        &self,
        session: &Session<DB>,
        tx_id: &str,
        tx: sqlx::Transaction<'static, DB>,
        err: E,
    ) -> Result<R, E>
    where
        E: From<DbError> + std::error::Error + Send + Sync + 'static,
    {
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        match session.bounded("rollback transaction", DB::rollback(tx)).await {
            Ok(Ok(())) => {
                debug!(parent: session.span(), transaction_id = %tx_id, error = %err, "Transaction rolled back");
                Err(err)
            }
            Ok(Err(source)) if DB::is_transaction_inactive(&source) => {
                debug!(
                    parent: session.span(),
                    transaction_id = %tx_id,
                    error = %source,
                    "Transaction already closed before rollback"
                );
                Err(err)
            }
            Ok(Err(source)) => {
                warn!(
                    parent: session.span(),
                    transaction_id = %tx_id,
                    error = %source,
                    cause = %err,
                    "Rollback failed"
                );
                Err(DbError::Rollback {
                    source,
                    cause: Box::new(err),
                }
                .into())
            }
            Err(_) => {
                warn!(
                    parent: session.span(),
                    transaction_id = %tx_id,
                    error = %err,
                    "Rollback abandoned at the session deadline"
                );
                Err(err)
            }
        }
    }

    async fn commit(
        &self,
        session: &Session<DB>,
        tx_id: &str,
        tx: sqlx::Transaction<'static, DB>,
    ) -> DbResult<()> {
        // A failed or abandoned commit drops the transaction, and sqlx rolls
        // back a dropped open transaction when its connection is returned.
        match session.bounded("commit transaction", DB::commit(tx)).await {
            Ok(Ok(())) => {
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                debug!(parent: session.span(), transaction_id = %tx_id, "Transaction committed");
                Ok(())
            }
            Ok(Err(e)) => {
                self.counters.commit_failed.fetch_add(1, Ordering::Relaxed);
                warn!(parent: session.span(), transaction_id = %tx_id, error = %e, "Commit failed");
                Err(DbError::Commit(e))
            }
            Err(timeout) => {
                self.counters.commit_failed.fetch_add(1, Ordering::Relaxed);
                warn!(parent: session.span(), transaction_id = %tx_id, "Commit exceeded the session deadline");
                Err(timeout)
            }
        }
    }

    /// Run `work(child)`, converting a panic into `DbError::PanicRecovered`.
    async fn run_guarded<R, E, F, Fut>(
        &self,
        session: &Session<DB>,
        child: Session<DB>,
        work: F,
    ) -> Result<R, E>
    where
        F: FnOnce(Session<DB>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<DbError>,
    {
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(move || work(child))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(payload) => Err(payload),
        };

        outcome.unwrap_or_else(|payload| {
            self.counters.panics_recovered.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(payload.as_ref());
            let stack = Backtrace::force_capture().to_string();
            error!(
                parent: session.span(),
                panic = %message,
                stack = %stack,
                "Panic recovered"
            );
            Err(DbError::PanicRecovered { message, stack }.into())
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
