//! Execution context threaded through the data-access layer.
//!
//! A [`Session`] carries the optional active transaction, the span used as
//! the logger, and an optional deadline. It is a plain value: callers pass it
//! explicitly, builder methods return new sessions, and clones ("child
//! sessions") share the parent's transaction.

use crate::error::{DbError, DbResult};
use sqlx::{Database, Transaction};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::Span;

/// Message returned when a session outlives the transaction it carries.
pub const TX_NOT_ACTIVE: &str = "Transaction is no longer active";

/// Shared slot for the transaction owned by one `Transactor::exec` call.
///
/// The slot is emptied exactly once, by the owner, right before commit or
/// rollback. Any clone still holding the cell afterwards sees `None`.
pub(crate) struct TxCell<DB: Database> {
    id: String,
    state: Mutex<Option<Transaction<'static, DB>>>,
}

impl<DB: Database> TxCell<DB> {
    pub(crate) fn new(tx: Transaction<'static, DB>) -> Self {
        Self {
            id: format!("tx_{}", uuid::Uuid::new_v4().simple()),
            state: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> &Mutex<Option<Transaction<'static, DB>>> {
        &self.state
    }

    /// Take the transaction out, closing the cell for every holder.
    pub(crate) async fn close(&self) -> Option<Transaction<'static, DB>> {
        self.state.lock().await.take()
    }
}

/// Execution context for queries and units of work.
pub struct Session<DB: Database> {
    tx: Option<Arc<TxCell<DB>>>,
    span: Span,
    deadline: Option<Instant>,
}

impl<DB: Database> Session<DB> {
    /// A session with no transaction, no deadline and a disabled span.
    pub fn new() -> Self {
        Self {
            tx: None,
            span: Span::none(),
            deadline: None,
        }
    }

    /// Use `span` as the parent of every log event emitted for this session.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span,
            ..self.clone()
        }
    }

    /// Bound every database call made through this session by `deadline`.
    ///
    /// A deadline already set on the session is only ever tightened.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True if this session carries a transaction (which may already be closed).
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.tx.as_deref().map(TxCell::id)
    }

    pub(crate) fn with_transaction(&self, cell: Arc<TxCell<DB>>) -> Self {
        Self {
            tx: Some(cell),
            ..self.clone()
        }
    }

    pub(crate) fn transaction(&self) -> Option<&TxCell<DB>> {
        self.tx.as_deref()
    }

    /// Fail with `Timeout` if the deadline has already passed.
    pub fn check_deadline(&self, operation: &str) -> DbResult<()> {
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Err(DbError::timeout(operation)),
            _ => Ok(()),
        }
    }

    /// Run `fut` bounded by the session deadline, if any.
    pub(crate) async fn bounded<F>(&self, operation: &str, fut: F) -> DbResult<F::Output>
    where
        F: Future,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| DbError::timeout(operation)),
            None => Ok(fut.await),
        }
    }
}

impl<DB: Database> Clone for Session<DB> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            span: self.span.clone(),
            deadline: self.deadline,
        }
    }
}

impl<DB: Database> Default for Session<DB> {
    fn default() -> Self {
        Self::new()
    }
}

impl<DB: Database> std::fmt::Debug for Session<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transaction_id", &self.transaction_id())
            .field("deadline", &self.deadline)
            .finish()
    }
}
