use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::openapi::schema::{ObjectBuilder, Schema, SchemaType};
use utoipa::openapi::RefOr;
use utoipa::ToSchema;

use crate::errors::AppError;
use crate::store::{Collection, StoredRecord};

// =============================================================================
// RESOURCE IDENTIFIERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Service,
    Page,
    Action,
}

impl ResourceKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ResourceKind::Service => "s",
            ResourceKind::Page => "ss",
            ResourceKind::Action => "sss",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "s" => Some(ResourceKind::Service),
            "ss" => Some(ResourceKind::Page),
            "sss" => Some(ResourceKind::Action),
            _ => None,
        }
    }
}

/// Composite resource identifier rendered as `<kindPrefix>:<rawId>`, e.g. `ss:12`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    kind: ResourceKind,
    raw: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, raw: impl Into<String>) -> Self {
        Self { kind, raw: raw.into() }
    }

    pub fn service(raw: impl Into<String>) -> Self {
        Self::new(ResourceKind::Service, raw)
    }

    pub fn page(raw: impl Into<String>) -> Self {
        Self::new(ResourceKind::Page, raw)
    }

    pub fn action(raw: impl Into<String>) -> Self {
        Self::new(ResourceKind::Action, raw)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.raw)
    }
}

impl FromStr for ResourceId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, raw) = s
            .split_once(':')
            .ok_or_else(|| AppError::bad_request(format!("invalid resource id: {s}")))?;
        let kind = ResourceKind::from_prefix(prefix)
            .ok_or_else(|| AppError::bad_request(format!("unknown resource kind prefix: {prefix}")))?;
        if raw.is_empty() {
            return Err(AppError::bad_request(format!("invalid resource id: {s}")));
        }
        Ok(Self::new(kind, raw))
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'s> ToSchema<'s> for ResourceId {
    fn schema() -> (&'s str, RefOr<Schema>) {
        let object = ObjectBuilder::new()
            .schema_type(SchemaType::String)
            .example(Some(serde_json::json!("ss:12")))
            .build();
        ("ResourceId", RefOr::T(Schema::Object(object)))
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// CATALOG ENTITIES (flat, as fetched)
// =============================================================================

/// Bilingual display label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Label {
    pub en: String,
    #[serde(default)]
    pub ar: String,
}

impl Label {
    pub fn new(en: impl Into<String>, ar: impl Into<String>) -> Self {
        Self { en: en.into(), ar: ar.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ServiceEntity {
    #[serde(default)]
    pub id: String,
    pub label: Label,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PageEntity {
    #[serde(default)]
    pub id: String,
    pub service_id: String,
    pub label: Label,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ActionEntity {
    #[serde(default)]
    pub id: String,
    pub service_id: String,
    pub label: Label,
}

impl StoredRecord for ServiceEntity {
    fn collection() -> Collection { Collection::Services }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

impl StoredRecord for PageEntity {
    fn collection() -> Collection { Collection::Pages }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

impl StoredRecord for ActionEntity {
    fn collection() -> Collection { Collection::Actions }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

// =============================================================================
// RESOURCE TREE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ResourceNode {
    pub id: ResourceId,
    pub label: Label,
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ResourceId>,
    pub children: Vec<ResourceNode>,
}

impl ResourceNode {
    /// Depth-first search for a node by id, including `self`.
    pub fn find(&self, id: &ResourceId) -> Option<&ResourceNode> {
        if &self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Ids of this node and all its descendants, pre-order.
    pub fn ids(&self) -> Vec<ResourceId> {
        let mut out = vec![self.id.clone()];
        for child in &self.children {
            out.extend(child.ids());
        }
        out
    }
}
