use std::collections::BTreeSet;

use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::AppResult;
use crate::models::{Company, Distribution, Scope, Section};
use crate::store::{fetch, Filter, RecordStore};

/// Companies and sections a job has been distributed into, restricted to the
/// ones still active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ValidScopes {
    pub companies: BTreeSet<String>,
    pub sections: BTreeSet<String>,
}

impl ValidScopes {
    pub fn is_empty(&self) -> bool {
        self.companies.is_empty() && self.sections.is_empty()
    }

    /// The global scope is always offerable; any populated field must be in
    /// the valid set.
    pub fn admits(&self, scope: &Scope) -> bool {
        let company_ok = scope
            .company_id
            .as_ref()
            .map_or(true, |c| self.companies.contains(c));
        let section_ok = scope
            .section_id
            .as_ref()
            .map_or(true, |s| self.sections.contains(s));
        company_ok && section_ok
    }
}

pub fn valid_scopes(job_id: &str, distributions: &[Distribution], companies: &[Company], sections: &[Section]) -> ValidScopes {
    let active_companies: BTreeSet<&str> = companies
        .iter()
        .filter(|c| c.active)
        .map(|c| c.id.as_str())
        .collect();
    let active_sections: BTreeSet<&str> = sections
        .iter()
        .filter(|s| s.active)
        .map(|s| s.id.as_str())
        .collect();

    let mut scopes = ValidScopes::default();
    for distribution in distributions.iter().filter(|d| d.job_id == job_id) {
        if let Some(company) = distribution.company_id.as_deref() {
            if active_companies.contains(company) {
                scopes.companies.insert(company.to_string());
            }
        }
        if let Some(section) = distribution.section_id.as_deref() {
            if active_sections.contains(section) {
                scopes.sections.insert(section.to_string());
            }
        }
    }
    scopes
}

pub async fn valid_scopes_for(store: &dyn RecordStore, job_id: &str) -> AppResult<ValidScopes> {
    let distributions: Vec<Distribution> = fetch(store, &Filter::new().eq("job_id", job_id)).await?;
    if distributions.is_empty() {
        return Ok(ValidScopes::default());
    }
    let companies: Vec<Company> = fetch(store, &Filter::new()).await?;
    let sections: Vec<Section> = fetch(store, &Filter::new()).await?;

    let scopes = valid_scopes(job_id, &distributions, &companies, &sections);
    tracing::debug!(
        job_id,
        companies = scopes.companies.len(),
        sections = scopes.sections.len(),
        "valid scopes computed"
    );
    Ok(scopes)
}
