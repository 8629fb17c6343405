use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::{AppError, AppResult};

/// Where a subject currently acts, as supplied by the caller on every check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubjectContext {
    pub user_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

impl SubjectContext {
    pub fn new(user_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            job_id: job_id.into(),
            company_id: None,
            section_id: None,
        }
    }

    pub fn in_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn in_section(mut self, section_id: impl Into<String>) -> Self {
        self.section_id = Some(section_id.into());
        self
    }
}

/// Organizational position of an entity being administered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrgPlacement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

// =============================================================================
// ACCESS SCOPE
// =============================================================================

/// Applicability of a job grant or access delegation. Empty means global.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

impl Scope {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn company(company_id: impl Into<String>) -> Self {
        Self {
            company_id: Some(company_id.into()),
            section_id: None,
        }
    }

    pub fn with_section(mut self, section_id: impl Into<String>) -> Self {
        self.section_id = Some(section_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.company_id.is_none() && self.section_id.is_none()
    }

    /// Conjunctive match: every populated field must equal the subject's context.
    pub fn matches(&self, ctx: &SubjectContext) -> bool {
        field_matches(&self.company_id, &ctx.company_id)
            && field_matches(&self.section_id, &ctx.section_id)
    }
}

// =============================================================================
// CONTROL SCOPE
// =============================================================================

/// Applicability of a control delegation rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct ControlScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    /// Dynamic scope: the administered entity must sit in the grantor's own company.
    #[serde(default)]
    pub restricted_to_grantor_company: bool,
}

impl ControlScope {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn grantor_company() -> Self {
        Self {
            restricted_to_grantor_company: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.restricted_to_grantor_company
            && self.company_id.is_none()
            && self.sector_id.is_none()
            && self.department_id.is_none()
            && self.section_id.is_none()
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.restricted_to_grantor_company && self.company_id.is_some() {
            return Err(AppError::validation(
                "restricted_to_grantor_company cannot be combined with an explicit company_id",
            ));
        }
        Ok(())
    }

    /// Whether an entity at `placement` falls inside this scope for a grantor
    /// currently acting in `grantor_company`.
    pub fn matches(&self, placement: &OrgPlacement, grantor_company: Option<&str>) -> bool {
        if self.restricted_to_grantor_company {
            match (grantor_company, placement.company_id.as_deref()) {
                (Some(grantor), Some(target)) if grantor == target => {}
                _ => return false,
            }
        }

        field_matches(&self.company_id, &placement.company_id)
            && field_matches(&self.sector_id, &placement.sector_id)
            && field_matches(&self.department_id, &placement.department_id)
            && field_matches(&self.section_id, &placement.section_id)
    }

    /// Whether every entity this scope reaches is also reached by `outer`.
    ///
    /// `grantor_company` is the company the editor holding `outer` acts in.
    /// A dynamic company restriction on `self` only stays inside a dynamic
    /// `outer` when both resolve against the same grantor (`same_grantor`).
    pub fn is_within(&self, outer: &ControlScope, grantor_company: Option<&str>, same_grantor: bool) -> bool {
        let company_ok = if outer.restricted_to_grantor_company {
            match (self.company_id.as_deref(), grantor_company) {
                (Some(company), Some(grantor)) => company == grantor,
                (None, _) => self.restricted_to_grantor_company && same_grantor,
                (Some(_), None) => false,
            }
        } else if self.restricted_to_grantor_company {
            outer.company_id.is_none()
        } else {
            field_narrows(&outer.company_id, &self.company_id)
        };

        company_ok
            && field_narrows(&outer.sector_id, &self.sector_id)
            && field_narrows(&outer.department_id, &self.department_id)
            && field_narrows(&outer.section_id, &self.section_id)
    }
}

fn field_narrows(outer: &Option<String>, inner: &Option<String>) -> bool {
    match outer {
        None => true,
        Some(required) => inner.as_deref() == Some(required.as_str()),
    }
}

fn field_matches(required: &Option<String>, actual: &Option<String>) -> bool {
    match required {
        None => true,
        Some(required) => actual.as_deref() == Some(required.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(company: &str, section: &str) -> SubjectContext {
        SubjectContext::new("u1", "j1").in_company(company).in_section(section)
    }

    #[test]
    fn empty_scope_matches_everywhere() {
        assert!(Scope::global().matches(&ctx("C1", "S1")));
        assert!(Scope::global().matches(&SubjectContext::new("u1", "j1")));
    }

    #[test]
    fn scope_match_is_conjunctive() {
        let scope = Scope::company("C1").with_section("S1");
        assert!(scope.matches(&ctx("C1", "S1")));
        assert!(!scope.matches(&ctx("C2", "S1")));
        assert!(!scope.matches(&ctx("C1", "S2")));
    }

    #[test]
    fn populated_field_requires_context_value() {
        let scope = Scope::company("C1");
        assert!(!scope.matches(&SubjectContext::new("u1", "j1")));
    }

    #[test]
    fn grantor_company_excludes_explicit_company() {
        let scope = ControlScope {
            company_id: Some("C1".into()),
            restricted_to_grantor_company: true,
            ..ControlScope::default()
        };
        assert!(matches!(scope.validate(), Err(AppError::Validation(_))));
        assert!(ControlScope::grantor_company().validate().is_ok());
    }

    #[test]
    fn grantor_company_scope_follows_grantor() {
        let scope = ControlScope::grantor_company();
        let placement = OrgPlacement {
            company_id: Some("C1".into()),
            ..OrgPlacement::default()
        };
        assert!(scope.matches(&placement, Some("C1")));
        assert!(!scope.matches(&placement, Some("C2")));
        assert!(!scope.matches(&placement, None));
    }

    #[test]
    fn control_scope_checks_sector_and_department() {
        let scope = ControlScope {
            sector_id: Some("SEC".into()),
            department_id: Some("D1".into()),
            ..ControlScope::default()
        };
        let inside = OrgPlacement {
            sector_id: Some("SEC".into()),
            department_id: Some("D1".into()),
            ..OrgPlacement::default()
        };
        let outside = OrgPlacement {
            sector_id: Some("SEC".into()),
            department_id: Some("D2".into()),
            ..OrgPlacement::default()
        };
        assert!(scope.matches(&inside, None));
        assert!(!scope.matches(&outside, None));
    }

    #[test]
    fn narrower_scope_stays_within() {
        let outer = ControlScope { sector_id: Some("SEC".into()), ..ControlScope::default() };
        let narrower = ControlScope {
            company_id: Some("C1".into()),
            sector_id: Some("SEC".into()),
            ..ControlScope::default()
        };
        assert!(narrower.is_within(&outer, None, false));
        assert!(!ControlScope::global().is_within(&outer, None, false));
        assert!(outer.is_within(&ControlScope::global(), None, false));
    }

    #[test]
    fn dynamic_company_containment() {
        let outer = ControlScope::grantor_company();
        let fixed = ControlScope { company_id: Some("C1".into()), ..ControlScope::default() };

        assert!(fixed.is_within(&outer, Some("C1"), false));
        assert!(!fixed.is_within(&outer, Some("C2"), false));
        assert!(!fixed.is_within(&outer, None, false));
        assert!(ControlScope::grantor_company().is_within(&outer, Some("C1"), true));
        assert!(!ControlScope::grantor_company().is_within(&outer, Some("C1"), false));
        assert!(!ControlScope::global().is_within(&outer, Some("C1"), true));
        assert!(!ControlScope::grantor_company().is_within(&fixed, Some("C1"), true));
    }
}
