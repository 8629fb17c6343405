use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::resource::Label;
use crate::models::scope::OrgPlacement;
use crate::store::{Collection, StoredRecord};

/// Read-only fact that a job is deployed into a company and/or organizational
/// unit. Distributions are where a job sits when someone administers it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Distribution {
    #[serde(default)]
    pub id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

impl Distribution {
    pub fn placement(&self) -> OrgPlacement {
        OrgPlacement {
            company_id: self.company_id.clone(),
            sector_id: self.sector_id.clone(),
            department_id: self.department_id.clone(),
            section_id: self.section_id.clone(),
        }
    }
}

impl StoredRecord for Distribution {
    fn collection() -> Collection { Collection::Distributions }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Company {
    #[serde(default)]
    pub id: String,
    pub label: Label,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl StoredRecord for Company {
    fn collection() -> Collection { Collection::Companies }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Section {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    pub label: Label,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl StoredRecord for Section {
    fn collection() -> Collection { Collection::Sections }
    fn record_id(&self) -> &str { &self.id }
    fn set_record_id(&mut self, id: String) { self.id = id; }
}

fn default_active() -> bool {
    true
}
