//! Users resource.
//!
//! A small repository built on the query executor. Every method takes the
//! caller's [`Session`], so the same code runs standalone or inside a
//! transaction opened by [`Transactor::exec`](crate::db::Transactor::exec).

use crate::db::{Backend, ConnContainer, Session, executor};
use crate::error::{DbError, DbResult};
use crate::params;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
)";

const INSERT_SQL: &str = "INSERT INTO users (id, email, name, created_at) VALUES ($1, $2, $3, $4)";

const SELECT_BY_ID_SQL: &str = "SELECT id, email, name, created_at FROM users WHERE id = $1";

const SELECT_BY_NAME_SQL: &str =
    "SELECT id, email, name, created_at FROM users WHERE name = :name ORDER BY created_at, id";

const SELECT_ALL_SQL: &str = "SELECT id, email, name, created_at FROM users ORDER BY created_at, id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for creating a user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub name: String,
}

impl NewUser {
    /// Reject obviously malformed input before it reaches the database.
    pub fn validate(&self) -> DbResult<()> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(DbError::invalid_input("email must be a valid address"));
        }
        if self.name.trim().is_empty() {
            return Err(DbError::invalid_input("name must not be empty"));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct NameFilter<'a> {
    name: &'a str,
}

/// Data access for the `users` table.
pub struct UserStore<DB: Backend> {
    conns: ConnContainer<DB>,
}

impl<DB: Backend> Clone for UserStore<DB> {
    fn clone(&self) -> Self {
        Self {
            conns: self.conns.clone(),
        }
    }
}

impl<DB: Backend> UserStore<DB>
where
    User: for<'r> FromRow<'r, DB::Row>,
{
    pub fn new(conns: ConnContainer<DB>) -> Self {
        Self { conns }
    }

    pub fn conns(&self) -> &ConnContainer<DB> {
        &self.conns
    }

    /// Create the `users` table if it does not exist.
    pub async fn init_schema(&self, session: &Session<DB>) -> DbResult<()> {
        executor::execute(session, &self.conns, CREATE_TABLE_SQL, &[]).await?;
        Ok(())
    }

    /// Insert a user. A taken email is [`DbError::DuplicateKey`].
    pub async fn create(&self, session: &Session<DB>, new_user: &NewUser) -> DbResult<User> {
        new_user.validate()?;
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            email: new_user.email.trim().to_string(),
            name: new_user.name.trim().to_string(),
            created_at: Utc::now(),
        };
        let params = params![&user.id, &user.email, &user.name, user.created_at];
        executor::execute(session, &self.conns, INSERT_SQL, &params).await?;
        Ok(user)
    }

    /// Look a user up by id. Unknown ids are [`DbError::NotFound`].
    pub async fn get(&self, session: &Session<DB>, id: &str) -> DbResult<User> {
        executor::query_one(session, &self.conns, SELECT_BY_ID_SQL, &params![id]).await
    }

    pub async fn list_by_name(&self, session: &Session<DB>, name: &str) -> DbResult<Vec<User>> {
        executor::named_query_many(session, &self.conns, SELECT_BY_NAME_SQL, &NameFilter { name })
            .await
    }

    pub async fn list(&self, session: &Session<DB>) -> DbResult<Vec<User>> {
        executor::query_many(session, &self.conns, SELECT_ALL_SQL, &[]).await
    }
}
