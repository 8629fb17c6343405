use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::errors::{AppError, AppResult};
use crate::models::{JobPermission, ResourceId, Scope, UserException};
use crate::store::{fetch, insert, Filter, RecordStore, StoredRecord};

/// Cross-cutting writes that run with elevated trust.
#[async_trait]
pub trait RemoteCall: Send + Sync {
    async fn call(&self, name: &str, payload: Value) -> AppResult<Value>;
}

pub const REPLACE_JOB_PERMISSIONS: &str = "replaceJobPermissions";
pub const CLEAR_USER_EXCEPTIONS: &str = "clearUserExceptions";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceJobPermissions {
    pub job_id: String,
    pub grants: Vec<GrantSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    pub resource_id: ResourceId,
    #[serde(default)]
    pub scope: Scope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearUserExceptions {
    pub user_id: String,
}

/// Procedures executed in-process directly against a record store.
pub struct LocalProcedures {
    store: Arc<dyn RecordStore>,
}

impl LocalProcedures {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    async fn replace_job_permissions(&self, req: ReplaceJobPermissions) -> AppResult<Value> {
        if req.job_id.trim().is_empty() {
            return Err(AppError::validation("jobId is required"));
        }

        let existing: Vec<JobPermission> = fetch(self.store.as_ref(), &Filter::new().eq("job_id", req.job_id.as_str())).await?;
        for grant in &existing {
            self.store.delete(JobPermission::collection(), grant.record_id()).await?;
        }

        let mut created = Vec::with_capacity(req.grants.len());
        for spec in req.grants {
            let grant = JobPermission {
                id: String::new(),
                job_id: req.job_id.clone(),
                resource_id: spec.resource_id,
                scope: spec.scope,
            };
            created.push(insert(self.store.as_ref(), &grant).await?);
        }

        tracing::info!(job_id = %req.job_id, removed = existing.len(), created = created.len(), "job permissions replaced");
        Ok(serde_json::json!({ "removed": existing.len(), "created": created }))
    }

    async fn clear_user_exceptions(&self, req: ClearUserExceptions) -> AppResult<Value> {
        let existing: Vec<UserException> = fetch(self.store.as_ref(), &Filter::new().eq("user_id", req.user_id.as_str())).await?;
        for exception in &existing {
            self.store.delete(UserException::collection(), exception.record_id()).await?;
        }
        tracing::info!(user_id = %req.user_id, removed = existing.len(), "user exceptions cleared");
        Ok(serde_json::json!({ "removed": existing.len() }))
    }
}

#[async_trait]
impl RemoteCall for LocalProcedures {
    async fn call(&self, name: &str, payload: Value) -> AppResult<Value> {
        match name {
            REPLACE_JOB_PERMISSIONS => {
                let req: ReplaceJobPermissions = serde_json::from_value(payload)
                    .map_err(|e| AppError::bad_request(format!("invalid {name} payload: {e}")))?;
                self.replace_job_permissions(req).await
            }
            CLEAR_USER_EXCEPTIONS => {
                let req: ClearUserExceptions = serde_json::from_value(payload)
                    .map_err(|e| AppError::bad_request(format!("invalid {name} payload: {e}")))?;
                self.clear_user_exceptions(req).await
            }
            other => Err(AppError::bad_request(format!("unknown procedure: {other}"))),
        }
    }
}
