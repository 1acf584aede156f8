//! db-transactor library
//!
//! A transactional data-access layer over `sqlx` pools: nested-safe units of
//! work, a connection provider aware of the active transaction, typed query
//! functions, and a stable error taxonomy. An HTTP boundary and a small users
//! resource exercise it end to end.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod users;

pub use config::Config;
pub use db::{ConnContainer, Session, Transactor};
pub use error::{DbError, DbResult};
