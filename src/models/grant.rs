use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::openapi::schema::{ObjectBuilder, Schema, SchemaType};
use utoipa::openapi::RefOr;
use utoipa::ToSchema;

use crate::delegation::OwnedGrant;
use crate::errors::{AppError, AppResult};
use crate::models::resource::ResourceId;
use crate::models::scope::{ControlScope, Scope};
use crate::store::{Collection, Filter, StoredRecord};

// =============================================================================
// OWNER
// =============================================================================

/// The job or user a record belongs to, rendered as `job:<id>` / `user:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Owner {
    Job(String),
    User(String),
}

impl Owner {
    pub fn job(id: impl Into<String>) -> Self {
        Owner::Job(id.into())
    }

    pub fn user(id: impl Into<String>) -> Self {
        Owner::User(id.into())
    }

    pub fn id(&self) -> &str {
        match self {
            Owner::Job(id) | Owner::User(id) => id,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Job(id) => write!(f, "job:{id}"),
            Owner::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for Owner {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("job", id)) if !id.is_empty() => Ok(Owner::Job(id.to_string())),
            Some(("user", id)) if !id.is_empty() => Ok(Owner::User(id.to_string())),
            _ => Err(AppError::bad_request(format!("invalid owner: {s}"))),
        }
    }
}

impl Serialize for Owner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Owner {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl<'s> ToSchema<'s> for Owner {
    fn schema() -> (&'s str, RefOr<Schema>) {
        let object = ObjectBuilder::new()
            .schema_type(SchemaType::String)
            .example(Some(serde_json::json!("job:J1")))
            .build();
        ("Owner", RefOr::T(Schema::Object(object)))
    }
}

// =============================================================================
// JOB PERMISSION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobPermission {
    #[serde(default)]
    pub id: String,
    pub job_id: String,
    pub resource_id: ResourceId,
    #[serde(default)]
    pub scope: Scope,
}

impl StoredRecord for JobPermission {
    fn collection() -> Collection { Collection::JobPermissions }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

impl OwnedGrant for JobPermission {
    type Target = ResourceId;
    type Value = Scope;

    const UNIQUE_PER_TARGET: bool = true;

    fn owner(&self) -> Owner {
        Owner::Job(self.job_id.clone())
    }

    fn target(&self) -> &ResourceId {
        &self.resource_id
    }

    fn value(&self) -> &Scope {
        &self.scope
    }

    fn assemble(owner: &Owner, target: ResourceId, value: Scope) -> AppResult<Self> {
        match owner {
            Owner::Job(job_id) => Ok(Self {
                id: String::new(),
                job_id: job_id.clone(),
                resource_id: target,
                scope: value,
            }),
            Owner::User(_) => Err(AppError::validation("job permissions belong to a job")),
        }
    }

    fn owner_filter(owner: &Owner) -> AppResult<Filter> {
        match owner {
            Owner::Job(job_id) => Ok(Filter::new().eq("job_id", job_id.as_str())),
            Owner::User(_) => Err(AppError::validation("job permissions belong to a job")),
        }
    }
}

// =============================================================================
// USER EXCEPTION
// =============================================================================

/// Per-user override of a job grant. `Inherit` is never stored: it is the
/// absence of an exception record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionState {
    Granted,
    Denied,
    #[default]
    Inherit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UserException {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub resource_id: ResourceId,
    pub state: ExceptionState,
}

impl StoredRecord for UserException {
    fn collection() -> Collection { Collection::UserExceptions }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

impl OwnedGrant for UserException {
    type Target = ResourceId;
    type Value = ExceptionState;

    const UNIQUE_PER_TARGET: bool = true;

    fn owner(&self) -> Owner {
        Owner::User(self.user_id.clone())
    }

    fn target(&self) -> &ResourceId {
        &self.resource_id
    }

    fn value(&self) -> &ExceptionState {
        &self.state
    }

    fn assemble(owner: &Owner, target: ResourceId, value: ExceptionState) -> AppResult<Self> {
        match owner {
            Owner::User(user_id) => Ok(Self {
                id: String::new(),
                user_id: user_id.clone(),
                resource_id: target,
                state: value,
            }),
            Owner::Job(_) => Err(AppError::validation("user exceptions belong to a user")),
        }
    }

    fn owner_filter(owner: &Owner) -> AppResult<Filter> {
        match owner {
            Owner::User(user_id) => Ok(Filter::new().eq("user_id", user_id.as_str())),
            Owner::Job(_) => Err(AppError::validation("user exceptions belong to a user")),
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.state == ExceptionState::Inherit {
            return Err(AppError::validation(
                "inherit is expressed by removing the exception, not storing it",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// ACCESS DELEGATION
// =============================================================================

/// An extra resource delegated to a job or user, additive to its base grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResourceGrant {
    #[serde(default)]
    pub id: String,
    pub owner: Owner,
    pub resource_id: ResourceId,
    #[serde(default)]
    pub scope: Scope,
}

impl StoredRecord for ResourceGrant {
    fn collection() -> Collection { Collection::AccessDelegations }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

impl OwnedGrant for ResourceGrant {
    type Target = ResourceId;
    type Value = Scope;

    fn owner(&self) -> Owner {
        self.owner.clone()
    }

    fn target(&self) -> &ResourceId {
        &self.resource_id
    }

    fn value(&self) -> &Scope {
        &self.scope
    }

    fn assemble(owner: &Owner, target: ResourceId, value: Scope) -> AppResult<Self> {
        Ok(Self {
            id: String::new(),
            owner: owner.clone(),
            resource_id: target,
            scope: value,
        })
    }

    fn owner_filter(owner: &Owner) -> AppResult<Filter> {
        Ok(Filter::new().eq("owner", owner.to_string()))
    }
}

// =============================================================================
// CONTROL DELEGATION
// =============================================================================

/// Which job(s) a control rule lets the grantor administer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DelegationTarget {
    All,
    Job(String),
}

impl DelegationTarget {
    pub fn covers(&self, job_id: &str) -> bool {
        match self {
            DelegationTarget::All => true,
            DelegationTarget::Job(id) => id == job_id,
        }
    }
}

impl fmt::Display for DelegationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegationTarget::All => f.write_str("ALL"),
            DelegationTarget::Job(id) => f.write_str(id),
        }
    }
}

impl From<&str> for DelegationTarget {
    fn from(value: &str) -> Self {
        match value {
            "ALL" => DelegationTarget::All,
            other => DelegationTarget::Job(other.to_string()),
        }
    }
}

impl Serialize for DelegationTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DelegationTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(DelegationTarget::from(s.as_str()))
    }
}

impl<'s> ToSchema<'s> for DelegationTarget {
    fn schema() -> (&'s str, RefOr<Schema>) {
        let object = ObjectBuilder::new()
            .schema_type(SchemaType::String)
            .description(Some("A job id, or ALL for every job"))
            .example(Some(serde_json::json!("ALL")))
            .build();
        ("DelegationTarget", RefOr::T(Schema::Object(object)))
    }
}

/// "The grantor may administer `target` within `scope`."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DelegationRule {
    #[serde(default)]
    pub id: String,
    pub grantor: Owner,
    pub target: DelegationTarget,
    #[serde(default)]
    pub scope: ControlScope,
}

impl StoredRecord for DelegationRule {
    fn collection() -> Collection { Collection::ControlDelegations }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

impl OwnedGrant for DelegationRule {
    type Target = DelegationTarget;
    type Value = ControlScope;

    fn owner(&self) -> Owner {
        self.grantor.clone()
    }

    fn target(&self) -> &DelegationTarget {
        &self.target
    }

    fn value(&self) -> &ControlScope {
        &self.scope
    }

    fn assemble(owner: &Owner, target: DelegationTarget, value: ControlScope) -> AppResult<Self> {
        Ok(Self {
            id: String::new(),
            grantor: owner.clone(),
            target,
            scope: value,
        })
    }

    fn owner_filter(owner: &Owner) -> AppResult<Filter> {
        Ok(Filter::new().eq("grantor", owner.to_string()))
    }

    fn validate(&self) -> AppResult<()> {
        match &self.target {
            DelegationTarget::Job(id) if id.trim().is_empty() => {
                return Err(AppError::validation("delegation rule is missing its target job"));
            }
            _ => {}
        }
        self.scope.validate()
    }
}
