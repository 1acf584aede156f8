use super::{AppState, ApiError, request_session};
use crate::db::Backend;
use crate::users::{NewUser, User};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::FromRow;

#[derive(Debug, Deserialize)]
pub(super) struct ListParams {
    name: Option<String>,
}

pub(super) async fn create_user<DB: Backend>(
    State(state): State<AppState<DB>>,
    Json(new_user): Json<NewUser>,
) -> Result<(StatusCode, Json<User>), ApiError>
where
    User: for<'r> FromRow<'r, DB::Row>,
{
    let session = request_session::<DB>();
    let store = state.users.clone();
    let user = state
        .transactor
        .exec(&session, |tx| async move { store.create(&tx, &new_user).await })
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub(super) async fn get_user<DB: Backend>(
    State(state): State<AppState<DB>>,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError>
where
    User: for<'r> FromRow<'r, DB::Row>,
{
    let session = request_session::<DB>();
    let user = state.users.get(&session, &id).await?;
    Ok(Json(user))
}

pub(super) async fn list_users<DB: Backend>(
    State(state): State<AppState<DB>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<User>>, ApiError>
where
    User: for<'r> FromRow<'r, DB::Row>,
{
    let session = request_session::<DB>();
    let users = match params.name.as_deref() {
        Some(name) => state.users.list_by_name(&session, name).await?,
        None => state.users.list(&session).await?,
    };
    Ok(Json(users))
}

pub(super) async fn health<DB: Backend>(
    State(state): State<AppState<DB>>,
) -> Result<Json<Value>, ApiError> {
    state.conns.ping().await?;
    Ok(Json(json!({
        "status": "ok",
        "backend": DB::KIND.display_name(),
        "transactions": state.transactor.stats(),
    })))
}
