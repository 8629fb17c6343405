use std::collections::HashMap;

use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::AppResult;
use crate::events::{ChangeKind, FeedEvent};
use crate::models::{
    ControlScope, DelegationRule, DelegationTarget, ExceptionState, JobPermission, OrgPlacement, Owner, ResourceGrant, ResourceId,
    Scope, SubjectContext, UserException,
};
use crate::store::{fetch, Collection, Filter, Record, RecordStore, StoredRecord};

/// Why a resolution came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    ExceptionGranted,
    ExceptionDenied,
    UserDelegation,
    JobGrant,
    ScopeMismatch,
    NoGrant,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::ExceptionGranted | Decision::UserDelegation | Decision::JobGrant)
    }
}

/// One indexed record, remembered so a later event for the same id can undo
/// its contribution.
#[derive(Debug, Clone)]
enum Indexed {
    Permission(JobPermission),
    Exception(UserException),
    Delegation(ResourceGrant),
    Rule(DelegationRule),
}

type ScopedGrants = HashMap<ResourceId, Vec<(String, Scope)>>;

/// In-memory lookup tables for resolution and control checks, keyed by
/// subject id and then by resource id.
#[derive(Debug, Default)]
pub struct PermissionIndex {
    /// Native job permissions plus access delegations owned by a job.
    job_grants: HashMap<String, ScopedGrants>,
    /// Access delegations owned by a user.
    user_grants: HashMap<String, ScopedGrants>,
    exceptions: HashMap<String, HashMap<ResourceId, (String, ExceptionState)>>,
    rules: HashMap<Owner, Vec<DelegationRule>>,
    by_record: HashMap<(Collection, String), Indexed>,
}

impl PermissionIndex {
    pub const COLLECTIONS: [Collection; 4] = [
        Collection::JobPermissions,
        Collection::UserExceptions,
        Collection::AccessDelegations,
        Collection::ControlDelegations,
    ];

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(store: &dyn RecordStore) -> AppResult<Self> {
        let mut index = Self::new();
        for permission in fetch::<JobPermission>(store, &Filter::new()).await? {
            index.insert(Indexed::Permission(permission));
        }
        for exception in fetch::<UserException>(store, &Filter::new()).await? {
            index.insert(Indexed::Exception(exception));
        }
        for grant in fetch::<ResourceGrant>(store, &Filter::new()).await? {
            index.insert(Indexed::Delegation(grant));
        }
        for rule in fetch::<DelegationRule>(store, &Filter::new()).await? {
            index.insert(Indexed::Rule(rule));
        }
        tracing::info!(records = index.len(), "permission index loaded");
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.by_record.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_record.is_empty()
    }

    /// Apply one change-feed event. Re-applying the same event is harmless:
    /// each event replaces whatever was cached for its record id.
    pub fn apply(&mut self, collection: Collection, event: &FeedEvent) {
        self.remove(collection, &event.id);
        if event.kind == ChangeKind::Removed {
            return;
        }

        let record = Record {
            id: event.id.clone(),
            data: event.data.clone(),
        };
        let parsed = match collection {
            Collection::JobPermissions => JobPermission::from_record(&record).map(Indexed::Permission),
            Collection::UserExceptions => UserException::from_record(&record).map(Indexed::Exception),
            Collection::AccessDelegations => ResourceGrant::from_record(&record).map(Indexed::Delegation),
            Collection::ControlDelegations => DelegationRule::from_record(&record).map(Indexed::Rule),
            _ => return,
        };
        match parsed {
            Ok(indexed) => self.insert(indexed),
            Err(err) => {
                tracing::warn!(%collection, record_id = %event.id, error = %err, "ignoring unreadable record");
            }
        }
    }

    fn insert(&mut self, indexed: Indexed) {
        match &indexed {
            Indexed::Permission(p) => {
                push_scoped(&mut self.job_grants, &p.job_id, &p.resource_id, &p.id, &p.scope);
            }
            Indexed::Exception(e) => {
                // Inherit is the absence of an exception.
                if e.state != ExceptionState::Inherit {
                    self.exceptions
                        .entry(e.user_id.clone())
                        .or_default()
                        .insert(e.resource_id.clone(), (e.id.clone(), e.state));
                }
            }
            Indexed::Delegation(g) => {
                let table = match &g.owner {
                    Owner::Job(_) => &mut self.job_grants,
                    Owner::User(_) => &mut self.user_grants,
                };
                push_scoped(table, g.owner.id(), &g.resource_id, &g.id, &g.scope);
            }
            Indexed::Rule(r) => {
                self.rules.entry(r.grantor.clone()).or_default().push(r.clone());
            }
        }

        let key = match &indexed {
            Indexed::Permission(p) => (Collection::JobPermissions, p.id.clone()),
            Indexed::Exception(e) => (Collection::UserExceptions, e.id.clone()),
            Indexed::Delegation(g) => (Collection::AccessDelegations, g.id.clone()),
            Indexed::Rule(r) => (Collection::ControlDelegations, r.id.clone()),
        };
        self.by_record.insert(key, indexed);
    }

    fn remove(&mut self, collection: Collection, record_id: &str) {
        let Some(indexed) = self.by_record.remove(&(collection, record_id.to_string())) else {
            return;
        };

        match indexed {
            Indexed::Permission(p) => drop_scoped(&mut self.job_grants, &p.job_id, &p.resource_id, &p.id),
            Indexed::Exception(e) => {
                if let Some(by_resource) = self.exceptions.get_mut(&e.user_id) {
                    if by_resource.get(&e.resource_id).is_some_and(|(id, _)| *id == e.id) {
                        by_resource.remove(&e.resource_id);
                    }
                    if by_resource.is_empty() {
                        self.exceptions.remove(&e.user_id);
                    }
                }
            }
            Indexed::Delegation(g) => {
                let table = match &g.owner {
                    Owner::Job(_) => &mut self.job_grants,
                    Owner::User(_) => &mut self.user_grants,
                };
                drop_scoped(table, g.owner.id(), &g.resource_id, &g.id);
            }
            Indexed::Rule(r) => {
                if let Some(rules) = self.rules.get_mut(&r.grantor) {
                    rules.retain(|existing| existing.id != r.id);
                    if rules.is_empty() {
                        self.rules.remove(&r.grantor);
                    }
                }
            }
        }
    }

    pub fn resolve(&self, subject: &SubjectContext, resource: &ResourceId) -> bool {
        self.explain(subject, resource).is_allowed()
    }

    /// Resolution with its reason. An explicit exception decides first; then a
    /// delegated user grant; then any job grant whose scope matches.
    pub fn explain(&self, subject: &SubjectContext, resource: &ResourceId) -> Decision {
        let decision = self.decide(subject, resource);
        tracing::debug!(
            user_id = %subject.user_id,
            job_id = %subject.job_id,
            resource = %resource,
            ?decision,
            "resolved"
        );
        decision
    }

    fn decide(&self, subject: &SubjectContext, resource: &ResourceId) -> Decision {
        let exception = self
            .exceptions
            .get(&subject.user_id)
            .and_then(|by_resource| by_resource.get(resource));
        match exception {
            Some((_, ExceptionState::Granted)) => return Decision::ExceptionGranted,
            Some((_, ExceptionState::Denied)) => return Decision::ExceptionDenied,
            _ => {}
        }

        if any_scope_matches(&self.user_grants, &subject.user_id, resource, subject) == Some(true) {
            return Decision::UserDelegation;
        }

        match any_scope_matches(&self.job_grants, &subject.job_id, resource, subject) {
            Some(true) => Decision::JobGrant,
            Some(false) => Decision::ScopeMismatch,
            None if self.user_grants.get(&subject.user_id).is_some_and(|g| g.contains_key(resource)) => {
                Decision::ScopeMismatch
            }
            None => Decision::NoGrant,
        }
    }

    /// Whether `editor` holds a control rule over `target` that reaches an
    /// entity at `placement`. Rules owned by the editor's job and by the
    /// editor personally both count, and `ALL` rules apply alongside
    /// job-specific ones. Authority over `ALL` itself needs an `ALL` rule.
    pub fn can_administer(&self, editor: &SubjectContext, target: &DelegationTarget, placement: &OrgPlacement) -> bool {
        let allowed = self
            .rules_covering(editor, target)
            .any(|rule| rule.scope.matches(placement, editor.company_id.as_deref()));

        tracing::debug!(
            user_id = %editor.user_id,
            job_id = %editor.job_id,
            target = %target,
            allowed,
            "control check"
        );
        allowed
    }

    /// Whether `editor` may hand `grantor` a rule over `target` with `scope`:
    /// one of the editor's own rules must cover the target with a scope at
    /// least as wide.
    pub fn can_delegate(&self, editor: &SubjectContext, grantor: &Owner, target: &DelegationTarget, scope: &ControlScope) -> bool {
        let same_grantor = editor_owners(editor).contains(grantor);
        let allowed = self
            .rules_covering(editor, target)
            .any(|rule| scope.is_within(&rule.scope, editor.company_id.as_deref(), same_grantor));

        tracing::debug!(
            user_id = %editor.user_id,
            job_id = %editor.job_id,
            grantor = %grantor,
            target = %target,
            allowed,
            "delegation check"
        );
        allowed
    }

    /// Rules held by the editor's job or the editor personally that reach
    /// `target`. Authority over `ALL` itself needs an `ALL` rule.
    fn rules_covering<'a>(&'a self, editor: &SubjectContext, target: &'a DelegationTarget) -> impl Iterator<Item = &'a DelegationRule> {
        editor_owners(editor)
            .into_iter()
            .filter_map(move |owner| self.rules.get(&owner))
            .flatten()
            .filter(move |rule| match target {
                DelegationTarget::All => rule.target == DelegationTarget::All,
                DelegationTarget::Job(job_id) => rule.target.covers(job_id),
            })
    }

    /// Control rules a grantor holds, in load order.
    pub fn rules_of(&self, grantor: &Owner) -> &[DelegationRule] {
        self.rules.get(grantor).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn editor_owners(editor: &SubjectContext) -> [Owner; 2] {
    [Owner::job(editor.job_id.as_str()), Owner::user(editor.user_id.as_str())]
}

fn push_scoped(table: &mut HashMap<String, ScopedGrants>, subject: &str, resource: &ResourceId, record_id: &str, scope: &Scope) {
    table
        .entry(subject.to_string())
        .or_default()
        .entry(resource.clone())
        .or_default()
        .push((record_id.to_string(), scope.clone()));
}

fn drop_scoped(table: &mut HashMap<String, ScopedGrants>, subject: &str, resource: &ResourceId, record_id: &str) {
    let Some(by_resource) = table.get_mut(subject) else {
        return;
    };
    if let Some(grants) = by_resource.get_mut(resource) {
        grants.retain(|(id, _)| id != record_id);
        if grants.is_empty() {
            by_resource.remove(resource);
        }
    }
    if by_resource.is_empty() {
        table.remove(subject);
    }
}

/// `None` when the subject holds no grant for the resource at all.
fn any_scope_matches(table: &HashMap<String, ScopedGrants>, subject: &str, resource: &ResourceId, ctx: &SubjectContext) -> Option<bool> {
    let grants = table.get(subject)?.get(resource)?;
    Some(grants.iter().any(|(_, scope)| scope.matches(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ControlScope;
    use serde_json::json;

    fn added(id: &str, data: serde_json::Value) -> FeedEvent {
        FeedEvent { kind: ChangeKind::Added, id: id.into(), data, is_pending_local_write: false }
    }

    fn removed(id: &str) -> FeedEvent {
        FeedEvent { kind: ChangeKind::Removed, id: id.into(), data: json!({}), is_pending_local_write: false }
    }

    fn user() -> SubjectContext {
        SubjectContext::new("U1", "J1").in_company("C1").in_section("S1")
    }

    #[test]
    fn denied_exception_beats_job_grant() {
        let mut index = PermissionIndex::new();
        index.apply(Collection::JobPermissions, &added("p1", json!({"job_id": "J1", "resource_id": "s:5"})));
        assert!(index.resolve(&user(), &ResourceId::service("5")));

        index.apply(
            Collection::UserExceptions,
            &added("e1", json!({"user_id": "U1", "resource_id": "s:5", "state": "denied"})),
        );
        assert_eq!(index.explain(&user(), &ResourceId::service("5")), Decision::ExceptionDenied);
    }

    #[test]
    fn job_delegation_counts_as_job_grant() {
        let mut index = PermissionIndex::new();
        index.apply(
            Collection::AccessDelegations,
            &added("d1", json!({"owner": "job:J1", "resource_id": "ss:7", "scope": {"company_id": "C1"}})),
        );
        assert_eq!(index.explain(&user(), &ResourceId::page("7")), Decision::JobGrant);
        assert!(!index.resolve(&SubjectContext::new("U1", "J1").in_company("C2"), &ResourceId::page("7")));
    }

    #[test]
    fn user_delegation_applies_without_exception() {
        let mut index = PermissionIndex::new();
        index.apply(
            Collection::AccessDelegations,
            &added("d1", json!({"owner": "user:U1", "resource_id": "sss:3"})),
        );
        assert_eq!(index.explain(&user(), &ResourceId::action("3")), Decision::UserDelegation);
        assert!(!index.resolve(&SubjectContext::new("U2", "J1"), &ResourceId::action("3")));
    }

    #[test]
    fn removal_and_reapply_are_idempotent() {
        let mut index = PermissionIndex::new();
        let grant = added("p1", json!({"job_id": "J1", "resource_id": "s:1"}));
        index.apply(Collection::JobPermissions, &grant);
        index.apply(Collection::JobPermissions, &grant);
        assert_eq!(index.len(), 1);

        index.apply(Collection::JobPermissions, &removed("p1"));
        index.apply(Collection::JobPermissions, &removed("p1"));
        assert!(index.is_empty());
        assert_eq!(index.explain(&user(), &ResourceId::service("1")), Decision::NoGrant);
    }

    #[test]
    fn modified_event_replaces_scope() {
        let mut index = PermissionIndex::new();
        index.apply(
            Collection::JobPermissions,
            &added("p1", json!({"job_id": "J1", "resource_id": "s:1", "scope": {"company_id": "C9"}})),
        );
        assert_eq!(index.explain(&user(), &ResourceId::service("1")), Decision::ScopeMismatch);

        let modified = FeedEvent {
            kind: ChangeKind::Modified,
            ..added("p1", json!({"job_id": "J1", "resource_id": "s:1", "scope": {"company_id": "C1"}}))
        };
        index.apply(Collection::JobPermissions, &modified);
        assert!(index.resolve(&user(), &ResourceId::service("1")));
    }

    #[test]
    fn control_rules_union_all_and_specific_targets() {
        let mut index = PermissionIndex::new();
        let placement = OrgPlacement { company_id: Some("C1".into()), ..OrgPlacement::default() };
        let rule = |id: &str, target: &str, scope: ControlScope| {
            added(id, serde_json::to_value(DelegationRule {
                id: String::new(),
                grantor: Owner::job("J1"),
                target: DelegationTarget::from(target),
                scope,
            }).unwrap())
        };

        index.apply(Collection::ControlDelegations, &rule("r1", "J7", ControlScope::global()));
        assert!(index.can_administer(&user(), &DelegationTarget::from("J7"), &placement));
        assert!(!index.can_administer(&user(), &DelegationTarget::from("J8"), &placement));
        assert!(!index.can_administer(&user(), &DelegationTarget::All, &placement));

        index.apply(Collection::ControlDelegations, &rule("r2", "ALL", ControlScope::grantor_company()));
        assert!(index.can_administer(&user(), &DelegationTarget::from("J8"), &placement));
        assert!(index.can_administer(&user(), &DelegationTarget::All, &placement));

        let elsewhere = OrgPlacement { company_id: Some("C2".into()), ..OrgPlacement::default() };
        assert!(!index.can_administer(&user(), &DelegationTarget::from("J8"), &elsewhere));
        // The job-specific global rule still reaches J7 in any company.
        assert!(index.can_administer(&user(), &DelegationTarget::from("J7"), &elsewhere));
        assert_eq!(index.rules_of(&Owner::job("J1")).len(), 2);
    }

    #[test]
    fn delegation_cannot_widen_the_editors_reach() {
        let mut index = PermissionIndex::new();
        index.apply(
            Collection::ControlDelegations,
            &added("r1", json!({"grantor": "job:J1", "target": "J1", "scope": {"company_id": "C1"}})),
        );
        let editor = user();

        assert!(index.can_delegate(&editor, &Owner::job("J5"), &DelegationTarget::from("J1"), &ControlScope {
            company_id: Some("C1".into()),
            section_id: Some("S1".into()),
            ..ControlScope::default()
        }));
        assert!(!index.can_delegate(&editor, &Owner::job("J1"), &DelegationTarget::All, &ControlScope {
            company_id: Some("C1".into()),
            ..ControlScope::default()
        }));
        assert!(!index.can_delegate(&editor, &Owner::job("J1"), &DelegationTarget::from("J1"), &ControlScope::global()));
        assert!(!index.can_delegate(&editor, &Owner::job("J1"), &DelegationTarget::from("J2"), &ControlScope {
            company_id: Some("C1".into()),
            ..ControlScope::default()
        }));
    }

    #[test]
    fn unreadable_records_are_skipped() {
        let mut index = PermissionIndex::new();
        index.apply(Collection::JobPermissions, &added("bad", json!({"job_id": "J1", "resource_id": "nope"})));
        assert!(index.is_empty());
    }
}
