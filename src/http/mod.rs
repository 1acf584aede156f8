//! HTTP boundary.
//!
//! Routes:
//! - `POST /users` creates a user inside a transaction
//! - `GET /users/{id}` fetches one user
//! - `GET /users?name=` lists users, optionally filtered by name
//! - `GET /health` pings both pools and reports transactor counters
//!
//! Every request runs in an `http_request` span carrying a `trace_id`, and
//! handlers derive their [`Session`] from that span.

pub mod error;
pub mod server;
mod users;

pub use error::ApiError;
pub use server::HttpServer;

use crate::db::{Backend, ConnContainer, Session, Transactor};
use crate::users::{User, UserStore};
use axum::Router;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use sqlx::FromRow;
use std::time::Instant;
use tracing::{Instrument, Span, info, info_span};

/// Header carrying the request's trace id, in and out.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state handed to every handler.
pub struct AppState<DB: Backend> {
    pub conns: ConnContainer<DB>,
    pub transactor: Transactor<DB>,
    pub users: UserStore<DB>,
}

impl<DB: Backend> Clone for AppState<DB> {
    fn clone(&self) -> Self {
        Self {
            conns: self.conns.clone(),
            transactor: self.transactor.clone(),
            users: self.users.clone(),
        }
    }
}

impl<DB: Backend> AppState<DB>
where
    User: for<'r> FromRow<'r, DB::Row>,
{
    pub fn new(conns: ConnContainer<DB>, transactor: Transactor<DB>) -> Self {
        Self {
            users: UserStore::new(conns.clone()),
            conns,
            transactor,
        }
    }
}

/// Build the application router.
pub fn router<DB: Backend>(state: AppState<DB>) -> Router
where
    User: for<'r> FromRow<'r, DB::Row>,
{
    Router::new()
        .route(
            "/users",
            get(users::list_users::<DB>).post(users::create_user::<DB>),
        )
        .route("/users/{id}", get(users::get_user::<DB>))
        .route("/health", get(users::health::<DB>))
        .layer(middleware::from_fn(trace_requests))
        .with_state(state)
}

/// A session whose log events nest under the current request span.
pub(crate) fn request_session<DB: Backend>() -> Session<DB> {
    Session::new().with_span(Span::current())
}

async fn trace_requests(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let start = Instant::now();

    async move {
        info!("Start http request");
        let mut response = next.run(request).await;
        info!(
            status = response.status().as_u16(),
            processing_time_ms = start.elapsed().as_millis() as u64,
            "Request processed"
        );
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}
