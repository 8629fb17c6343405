use std::sync::Arc;

use axum::http::Method;
use axum::routing::{delete, get, post, put};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::delegation::{GrantManager, OwnedGrant};
use crate::errors::AppError;
use crate::events::ChangeFeed;
use crate::jwt::{AuthUser, JwtConfig};
use crate::routes::{access, delegations, health, jobs, resources, users};
use crate::service::AccessService;
use crate::store::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub service: Arc<AccessService>,
    pub jwt: Arc<JwtConfig>,
}

impl AppState {
    pub fn new(store: SqliteStore, service: AccessService, jwt: JwtConfig) -> Self {
        Self {
            store,
            service: Arc::new(service),
            jwt: Arc::new(jwt),
        }
    }

    /// A grant manager whose writes are tagged with the caller's session.
    pub fn manager<R: OwnedGrant>(&self, auth: &AuthUser) -> GrantManager<R> {
        GrantManager::new(Arc::new(self.store.with_origin(auth.session_id)))
    }
}

pub async fn create_app(pool: SqlitePool, config: &AppConfig) -> Result<Router, AppError> {
    let store = SqliteStore::new(pool, ChangeFeed::new(config.feed_capacity));
    let service = AccessService::start(Arc::new(store.clone()), config.root_jobs.clone()).await?;
    let state = AppState::new(store, service, config.jwt.clone());

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    let job_routes = Router::new()
        .route("/:job_id/permissions", get(jobs::list_permissions))
        .route("/:job_id/permissions", put(jobs::replace_permissions))
        .route("/:job_id/permissions/batch", post(jobs::save_permissions))
        .route("/:job_id/valid-scopes", get(jobs::valid_scopes));

    let user_routes = Router::new()
        .route("/:user_id/exceptions", get(users::list_exceptions))
        .route("/:user_id/exceptions", delete(users::clear_exceptions))
        .route("/:user_id/exceptions/batch", post(users::save_exceptions));

    let delegation_routes = Router::new()
        .route("/access/:owner", get(delegations::list_access))
        .route("/access/:owner", post(delegations::grant_access))
        .route("/access/:owner/scope", put(delegations::replace_access_scope))
        .route("/access/:owner/records/:record_id", delete(delegations::revoke_access))
        .route("/control/:owner", get(delegations::list_control))
        .route("/control/:owner", post(delegations::grant_control))
        .route("/control/:owner/scope", put(delegations::replace_control_scope))
        .route("/control/:owner/records/:record_id", delete(delegations::revoke_control));

    let api = Router::new()
        .route("/health", get(health::health))
        .route("/resources/tree", get(resources::tree))
        .route("/access/check", post(access::check))
        .nest("/jobs", job_routes)
        .nest("/users", user_routes)
        .nest("/delegations", delegation_routes);

    let router = Router::new()
        .nest("/api", api)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    Ok(router)
}
