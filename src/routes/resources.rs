use axum::extract::State;
use axum::Json;

use crate::app::AppState;
use crate::errors::AppResult;
use crate::jwt::AuthUser;
use crate::models::ResourceNode;

#[utoipa::path(
    get,
    path = "/api/resources/tree",
    tag = "Resources",
    responses((status = 200, description = "Service/page/action forest", body = [ResourceNode]))
)]
pub async fn tree(State(state): State<AppState>, _auth: AuthUser) -> AppResult<Json<Vec<ResourceNode>>> {
    Ok(Json(state.service.tree().await?))
}
