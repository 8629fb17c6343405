use std::collections::{BTreeMap, BTreeSet};

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::delegation::{BatchOutcome, GrantView};
use crate::errors::AppResult;
use crate::jwt::AuthUser;
use crate::models::{ExceptionState, Owner, ResourceId, UserException};

/// Resource id -> exception state. `inherit` entries are the same as absent ones.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExceptionBatchRequest {
    #[schema(value_type = Object)]
    pub baseline: BTreeMap<ResourceId, ExceptionState>,
    #[schema(value_type = Object)]
    pub local: BTreeMap<ResourceId, ExceptionState>,
    #[serde(default)]
    pub force: bool,
}

fn to_view(states: BTreeMap<ResourceId, ExceptionState>) -> GrantView<UserException> {
    states
        .into_iter()
        .filter(|(_, state)| *state != ExceptionState::Inherit)
        .map(|(resource, state)| (resource, BTreeSet::from([state])))
        .collect()
}

#[utoipa::path(
    get,
    path = "/api/users/{user_id}/exceptions",
    tag = "Users",
    params(("user_id" = String, Path, description = "User id")),
    responses((status = 200, description = "Exceptions of the user", body = [UserException]))
)]
pub async fn list_exceptions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<UserException>>> {
    let exceptions = state.service.user_exceptions().list(&Owner::User(user_id)).await?;
    Ok(Json(exceptions))
}

#[utoipa::path(
    post,
    path = "/api/users/{user_id}/exceptions/batch",
    tag = "Users",
    params(("user_id" = String, Path, description = "User id")),
    request_body = ExceptionBatchRequest,
    responses(
        (status = 200, description = "Changes applied", body = BatchOutcome),
        (status = 409, description = "Stored exceptions changed since the baseline, or some operations failed"),
        (status = 403, description = "Caller may not administer users")
    )
)]
pub async fn save_exceptions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    auth: AuthUser,
    Json(payload): Json<ExceptionBatchRequest>,
) -> AppResult<Json<BatchOutcome>> {
    let owner = Owner::User(user_id);
    state.service.authorize(&auth.subject, &owner).await?;

    let baseline = to_view(payload.baseline);
    let local = to_view(payload.local);
    let outcome = state
        .manager::<UserException>(&auth)
        .save_from(&owner, &baseline, &local, payload.force)
        .await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    delete,
    path = "/api/users/{user_id}/exceptions",
    tag = "Users",
    params(("user_id" = String, Path, description = "User id")),
    responses(
        (status = 200, description = "All exceptions removed"),
        (status = 403, description = "Caller may not administer users")
    )
)]
pub async fn clear_exceptions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    auth: AuthUser,
) -> AppResult<Json<Value>> {
    let owner = Owner::User(user_id);
    state.service.authorize(&auth.subject, &owner).await?;
    Ok(Json(state.service.clear_user_exceptions(owner.id()).await?))
}
