//! Record store, change-feed source and remote procedure contracts.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{AppError, AppResult};
use crate::events::Subscription;

pub mod memory;
pub mod rpc;
pub mod sqlite;

pub use memory::MemoryStore;
pub use rpc::{LocalProcedures, RemoteCall};
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Services,
    Pages,
    Actions,
    Companies,
    Sections,
    Distributions,
    JobPermissions,
    UserExceptions,
    AccessDelegations,
    ControlDelegations,
}

impl Collection {
    pub const ALL: [Collection; 10] = [
        Collection::Services,
        Collection::Pages,
        Collection::Actions,
        Collection::Companies,
        Collection::Sections,
        Collection::Distributions,
        Collection::JobPermissions,
        Collection::UserExceptions,
        Collection::AccessDelegations,
        Collection::ControlDelegations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Services => "services",
            Collection::Pages => "pages",
            Collection::Actions => "actions",
            Collection::Companies => "companies",
            Collection::Sections => "sections",
            Collection::Distributions => "distributions",
            Collection::JobPermissions => "job_permissions",
            Collection::UserExceptions => "user_exceptions",
            Collection::AccessDelegations => "access_delegations",
            Collection::ControlDelegations => "control_delegations",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AppError::bad_request(format!("unknown collection: {s}")))
    }
}

/// A stored document: opaque id plus its JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub data: Value,
}

/// Conjunction of equality clauses on top-level fields of a record body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
    }
}

/// A typed record living in one collection. The record id is carried on the
/// struct but not inside the stored body.
pub trait StoredRecord: Serialize + DeserializeOwned + Send + Sync {
    fn collection() -> Collection;

    fn record_id(&self) -> &str;

    fn set_record_id(&mut self, id: String);

    fn from_record(record: &Record) -> AppResult<Self> {
        let mut value: Self = serde_json::from_value(record.data.clone())?;
        value.set_record_id(record.id.clone());
        Ok(value)
    }

    /// Body to store. A non-empty id is kept so the store reuses it.
    fn to_data(&self) -> AppResult<Value> {
        let mut data = serde_json::to_value(self)?;
        if self.record_id().is_empty() {
            if let Some(obj) = data.as_object_mut() {
                obj.remove("id");
            }
        }
        Ok(data)
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn query(&self, collection: Collection, filter: &Filter) -> AppResult<Vec<Record>>;

    /// Creates a record and returns its id. A string `id` field in `data` is
    /// used as the record id; otherwise one is generated.
    async fn create(&self, collection: Collection, data: Value) -> AppResult<String>;

    async fn delete(&self, collection: Collection, id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Subscribe to one collection. Records existing at subscribe time are
    /// delivered first as `added` events.
    async fn subscribe(&self, collection: Collection, filter: Filter) -> AppResult<Subscription>;
}

/// A store that can both be written and watched.
pub trait Store: RecordStore + ChangeSource {}

impl<T: RecordStore + ChangeSource> Store for T {}

pub async fn fetch<R: StoredRecord>(store: &dyn RecordStore, filter: &Filter) -> AppResult<Vec<R>> {
    store
        .query(R::collection(), filter)
        .await?
        .iter()
        .map(R::from_record)
        .collect()
}

pub async fn insert<R: StoredRecord>(store: &dyn RecordStore, record: &R) -> AppResult<String> {
    store.create(R::collection(), record.to_data()?).await
}

/// Splits the explicit id (if any) off a record body.
pub(crate) fn take_record_id(data: &mut Value) -> AppResult<Option<String>> {
    let obj = data
        .as_object_mut()
        .ok_or_else(|| AppError::bad_request("record body must be a JSON object"))?;
    match obj.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(Some(id)),
        Some(Value::String(_)) | Some(Value::Null) | None => Ok(None),
        Some(other) => Err(AppError::bad_request(format!("record id must be a string, got {other}"))),
    }
}
