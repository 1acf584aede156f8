//! Database abstraction layer.
//!
//! This module provides transactional data access:
//! - Backends (PostgreSQL, SQLite) behind one trait
//! - Execution sessions carrying the active transaction, span and deadline
//! - Connection provider resolving transaction or primary pool
//! - Transaction manager with owner/participant nesting
//! - Typed query execution with classified errors

pub mod backend;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod session;
pub mod transactor;

pub use backend::{Backend, BackendKind};
pub use executor::{execute, named_query_many, query_many, query_one};
pub use params::{NamedQuery, QueryParam};
pub use pool::{Conn, ConnContainer};
pub use session::Session;
pub use transactor::{Transactor, TransactorStats};
