use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::app::AppState;
use crate::authz::Decision;
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::ResourceId;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckRequest {
    pub resources: Vec<ResourceId>,
    /// Include the reason for each decision.
    #[serde(default)]
    pub explain: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckResponse {
    #[schema(value_type = Object)]
    pub results: BTreeMap<ResourceId, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub reasons: Option<BTreeMap<ResourceId, Decision>>,
}

#[utoipa::path(
    post,
    path = "/api/access/check",
    tag = "Access",
    request_body = CheckRequest,
    responses(
        (status = 200, description = "Decision per resource for the caller", body = CheckResponse),
        (status = 400, description = "Empty request")
    )
)]
pub async fn check(State(state): State<AppState>, auth: AuthUser, Json(payload): Json<CheckRequest>) -> AppResult<Json<CheckResponse>> {
    if payload.resources.is_empty() {
        return Err(AppError::bad_request("resources must not be empty"));
    }

    let results = state.service.resolve_many(&auth.subject, &payload.resources).await;

    let reasons = if payload.explain {
        let mut reasons = BTreeMap::new();
        for resource in &payload.resources {
            reasons.insert(resource.clone(), state.service.explain(&auth.subject, resource).await);
        }
        Some(reasons)
    } else {
        None
    };

    Ok(Json(CheckResponse { results, reasons }))
}
