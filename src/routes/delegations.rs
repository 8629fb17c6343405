use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::errors::AppResult;
use crate::jwt::AuthUser;
use crate::models::{ControlScope, DelegationRule, DelegationTarget, Owner, ResourceGrant, ResourceId, Scope};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AccessGrantRequest {
    pub resource_id: ResourceId,
    #[serde(default)]
    pub scope: Scope,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ControlGrantRequest {
    pub target: DelegationTarget,
    #[serde(default)]
    pub scope: ControlScope,
}

// =============================================================================
// ACCESS DELEGATION
// =============================================================================

#[utoipa::path(
    get,
    path = "/api/delegations/access/{owner}",
    tag = "Delegations",
    params(("owner" = String, Path, description = "job:<id> or user:<id>")),
    responses((status = 200, description = "Delegated resources", body = [ResourceGrant]))
)]
pub async fn list_access(
    State(state): State<AppState>,
    Path(owner): Path<Owner>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<ResourceGrant>>> {
    Ok(Json(state.service.access_delegations().list(&owner).await?))
}

#[utoipa::path(
    post,
    path = "/api/delegations/access/{owner}",
    tag = "Delegations",
    params(("owner" = String, Path, description = "job:<id> or user:<id>")),
    request_body = AccessGrantRequest,
    responses(
        (status = 201, description = "Resource delegated", body = ResourceGrant),
        (status = 422, description = "Scope outside the job's distribution")
    )
)]
pub async fn grant_access(
    State(state): State<AppState>,
    Path(owner): Path<Owner>,
    auth: AuthUser,
    Json(payload): Json<AccessGrantRequest>,
) -> AppResult<(StatusCode, Json<ResourceGrant>)> {
    state.service.authorize(&auth.subject, &owner).await?;
    state.service.check_delegable(&owner, &payload.scope).await?;

    let grant = state
        .manager::<ResourceGrant>(&auth)
        .grant(&owner, payload.resource_id, payload.scope)
        .await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

#[utoipa::path(
    put,
    path = "/api/delegations/access/{owner}/scope",
    tag = "Delegations",
    params(("owner" = String, Path, description = "job:<id> or user:<id>")),
    request_body = AccessGrantRequest,
    responses(
        (status = 200, description = "Scope replaced; the record id changes", body = ResourceGrant),
        (status = 404, description = "Owner has no delegation for the resource")
    )
)]
pub async fn replace_access_scope(
    State(state): State<AppState>,
    Path(owner): Path<Owner>,
    auth: AuthUser,
    Json(payload): Json<AccessGrantRequest>,
) -> AppResult<Json<ResourceGrant>> {
    state.service.authorize(&auth.subject, &owner).await?;
    state.service.check_delegable(&owner, &payload.scope).await?;

    let grant = state
        .manager::<ResourceGrant>(&auth)
        .replace_scope(&owner, &payload.resource_id, payload.scope)
        .await?;
    Ok(Json(grant))
}

#[utoipa::path(
    delete,
    path = "/api/delegations/access/{owner}/records/{record_id}",
    tag = "Delegations",
    params(
        ("owner" = String, Path, description = "job:<id> or user:<id>"),
        ("record_id" = String, Path, description = "Delegation record id")
    ),
    responses((status = 204, description = "Delegation revoked"), (status = 404, description = "Not found for owner"))
)]
pub async fn revoke_access(
    State(state): State<AppState>,
    Path((owner, record_id)): Path<(Owner, String)>,
    auth: AuthUser,
) -> AppResult<StatusCode> {
    state.service.authorize(&auth.subject, &owner).await?;
    state.manager::<ResourceGrant>(&auth).revoke(&owner, &record_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// CONTROL DELEGATION
// =============================================================================

#[utoipa::path(
    get,
    path = "/api/delegations/control/{owner}",
    tag = "Delegations",
    params(("owner" = String, Path, description = "job:<id> or user:<id>")),
    responses((status = 200, description = "Control rules held by the owner", body = [DelegationRule]))
)]
pub async fn list_control(
    State(state): State<AppState>,
    Path(owner): Path<Owner>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<DelegationRule>>> {
    Ok(Json(state.service.control_delegations().list(&owner).await?))
}

#[utoipa::path(
    post,
    path = "/api/delegations/control/{owner}",
    tag = "Delegations",
    params(("owner" = String, Path, description = "job:<id> or user:<id>")),
    request_body = ControlGrantRequest,
    responses(
        (status = 201, description = "Control rule created", body = DelegationRule),
        (status = 403, description = "Caller cannot administer the grantor or target, or the scope exceeds their own"),
        (status = 422, description = "Missing target or contradictory scope")
    )
)]
pub async fn grant_control(
    State(state): State<AppState>,
    Path(owner): Path<Owner>,
    auth: AuthUser,
    Json(payload): Json<ControlGrantRequest>,
) -> AppResult<(StatusCode, Json<DelegationRule>)> {
    state
        .service
        .authorize_rule(&auth.subject, &owner, &payload.target, &payload.scope)
        .await?;

    let rule = state
        .manager::<DelegationRule>(&auth)
        .grant(&owner, payload.target, payload.scope)
        .await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[utoipa::path(
    put,
    path = "/api/delegations/control/{owner}/scope",
    tag = "Delegations",
    params(("owner" = String, Path, description = "job:<id> or user:<id>")),
    request_body = ControlGrantRequest,
    responses(
        (status = 200, description = "Scope replaced; the record id changes", body = DelegationRule),
        (status = 403, description = "Caller cannot administer the grantor or target, or the scope exceeds their own"),
        (status = 404, description = "Owner has no rule for the target")
    )
)]
pub async fn replace_control_scope(
    State(state): State<AppState>,
    Path(owner): Path<Owner>,
    auth: AuthUser,
    Json(payload): Json<ControlGrantRequest>,
) -> AppResult<Json<DelegationRule>> {
    state
        .service
        .authorize_rule(&auth.subject, &owner, &payload.target, &payload.scope)
        .await?;

    let rule = state
        .manager::<DelegationRule>(&auth)
        .replace_scope(&owner, &payload.target, payload.scope)
        .await?;
    Ok(Json(rule))
}

#[utoipa::path(
    delete,
    path = "/api/delegations/control/{owner}/records/{record_id}",
    tag = "Delegations",
    params(
        ("owner" = String, Path, description = "job:<id> or user:<id>"),
        ("record_id" = String, Path, description = "Control rule record id")
    ),
    responses((status = 204, description = "Rule revoked"), (status = 404, description = "Not found for owner"))
)]
pub async fn revoke_control(
    State(state): State<AppState>,
    Path((owner, record_id)): Path<(Owner, String)>,
    auth: AuthUser,
) -> AppResult<StatusCode> {
    state.service.authorize(&auth.subject, &owner).await?;
    state.manager::<DelegationRule>(&auth).revoke(&owner, &record_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
