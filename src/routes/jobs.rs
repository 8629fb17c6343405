use std::collections::{BTreeMap, BTreeSet};

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::authz::ValidScopes;
use crate::delegation::BatchOutcome;
use crate::errors::AppResult;
use crate::jwt::AuthUser;
use crate::models::{JobPermission, Owner, ResourceId, Scope};
use crate::store::rpc::GrantSpec;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReplacePermissionsRequest {
    pub grants: Vec<GrantSpec>,
}

/// Resource id -> scopes, as last loaded (`baseline`) and as edited (`local`).
#[derive(Debug, Deserialize, ToSchema)]
pub struct PermissionBatchRequest {
    #[schema(value_type = Object)]
    pub baseline: BTreeMap<ResourceId, BTreeSet<Scope>>,
    #[schema(value_type = Object)]
    pub local: BTreeMap<ResourceId, BTreeSet<Scope>>,
    /// Save even if the stored grants moved on since `baseline` was loaded.
    #[serde(default)]
    pub force: bool,
}

#[utoipa::path(
    get,
    path = "/api/jobs/{job_id}/permissions",
    tag = "Jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses((status = 200, description = "Grants of the job", body = [JobPermission]))
)]
pub async fn list_permissions(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<JobPermission>>> {
    let grants = state.service.job_permissions().list(&Owner::Job(job_id)).await?;
    Ok(Json(grants))
}

#[utoipa::path(
    put,
    path = "/api/jobs/{job_id}/permissions",
    tag = "Jobs",
    params(("job_id" = String, Path, description = "Job id")),
    request_body = ReplacePermissionsRequest,
    responses(
        (status = 200, description = "Grant set replaced"),
        (status = 403, description = "No control delegation covers the job")
    )
)]
pub async fn replace_permissions(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    auth: AuthUser,
    Json(payload): Json<ReplacePermissionsRequest>,
) -> AppResult<Json<Value>> {
    let owner = Owner::Job(job_id);
    state.service.authorize(&auth.subject, &owner).await?;

    let result = state.service.replace_job_permissions(owner.id(), payload.grants).await?;
    Ok(Json(result))
}

#[utoipa::path(
    post,
    path = "/api/jobs/{job_id}/permissions/batch",
    tag = "Jobs",
    params(("job_id" = String, Path, description = "Job id")),
    request_body = PermissionBatchRequest,
    responses(
        (status = 200, description = "Changes applied", body = BatchOutcome),
        (status = 409, description = "Stored grants changed since the baseline, or some operations failed"),
        (status = 403, description = "No control delegation covers the job")
    )
)]
pub async fn save_permissions(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    auth: AuthUser,
    Json(payload): Json<PermissionBatchRequest>,
) -> AppResult<Json<BatchOutcome>> {
    let owner = Owner::Job(job_id);
    state.service.authorize(&auth.subject, &owner).await?;

    let outcome = state
        .manager::<JobPermission>(&auth)
        .save_from(&owner, &payload.baseline, &payload.local, payload.force)
        .await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    get,
    path = "/api/jobs/{job_id}/valid-scopes",
    tag = "Jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses((status = 200, description = "Active companies and sections the job is distributed into", body = ValidScopes))
)]
pub async fn valid_scopes(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    _auth: AuthUser,
) -> AppResult<Json<ValidScopes>> {
    Ok(Json(state.service.valid_scopes_for(&job_id).await?))
}
