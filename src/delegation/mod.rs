//! Grant managers: append/delete-only administration of owned grant records.
//!
//! The same manager shape drives job permissions, user exceptions, access
//! delegation ([`ResourceGrant`](crate::models::ResourceGrant)) and control
//! delegation ([`DelegationRule`](crate::models::DelegationRule)).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::{AppError, AppResult};
use crate::models::Owner;
use crate::reconcile::{diff, Changeset};
use crate::store::{fetch, insert, Filter, RecordStore, StoredRecord};

/// A record owned by one job or user, identified for editing purposes by its
/// target and carrying one value (scope or exception state).
pub trait OwnedGrant: StoredRecord + Clone + fmt::Debug + 'static {
    type Target: Ord + Clone + fmt::Display + fmt::Debug + Send + Sync;
    type Value: Ord + Clone + fmt::Debug + Send + Sync;

    /// At most one record may exist per (owner, target).
    const UNIQUE_PER_TARGET: bool = false;

    fn owner(&self) -> Owner;

    fn target(&self) -> &Self::Target;

    fn value(&self) -> &Self::Value;

    fn assemble(owner: &Owner, target: Self::Target, value: Self::Value) -> AppResult<Self>;

    fn owner_filter(owner: &Owner) -> AppResult<Filter>;

    fn validate(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Editable projection of an owner's records: target -> set of values.
pub type GrantView<R> = BTreeMap<<R as OwnedGrant>::Target, BTreeSet<<R as OwnedGrant>::Value>>;

pub fn project<'a, R: OwnedGrant>(records: impl IntoIterator<Item = &'a R>) -> GrantView<R> {
    let mut view = GrantView::<R>::new();
    for record in records {
        view.entry(record.target().clone())
            .or_default()
            .insert(record.value().clone());
    }
    view
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct BatchOutcome {
    pub revoked: usize,
    pub granted: usize,
}

pub struct GrantManager<R> {
    store: Arc<dyn RecordStore>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for GrantManager<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _record: PhantomData,
        }
    }
}

impl<R: OwnedGrant> GrantManager<R> {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    pub async fn list(&self, owner: &Owner) -> AppResult<Vec<R>> {
        fetch(self.store.as_ref(), &R::owner_filter(owner)?).await
    }

    pub async fn view(&self, owner: &Owner) -> AppResult<GrantView<R>> {
        Ok(project(&self.list(owner).await?))
    }

    /// Appends one record. No dedup beyond the store's own key constraints.
    pub async fn grant(&self, owner: &Owner, target: R::Target, value: R::Value) -> AppResult<R> {
        let mut record = R::assemble(owner, target, value)?;
        record.validate()?;

        if R::UNIQUE_PER_TARGET && self.list(owner).await?.iter().any(|r| r.target() == record.target()) {
            return Err(AppError::conflict(format!(
                "{owner} already has a {} record for {}",
                R::collection(),
                record.target()
            )));
        }

        let id = insert(self.store.as_ref(), &record).await?;
        record.set_record_id(id);

        tracing::info!(
            collection = %R::collection(),
            owner = %owner,
            target = %record.target(),
            record_id = %record.record_id(),
            "grant created"
        );
        Ok(record)
    }

    /// Deletes exactly one record, which must belong to `owner`.
    pub async fn revoke(&self, owner: &Owner, record_id: &str) -> AppResult<()> {
        let owned = self
            .list(owner)
            .await?
            .into_iter()
            .any(|r| r.record_id() == record_id);
        if !owned {
            return Err(AppError::not_found(format!(
                "{} record {record_id} not found for {owner}",
                R::collection()
            )));
        }

        self.store.delete(R::collection(), record_id).await?;
        tracing::info!(collection = %R::collection(), owner = %owner, record_id, "grant revoked");
        Ok(())
    }

    /// Revoke-then-grant; not atomic. If the grant fails after the revoke the
    /// target is left without a record, which resolves as "no grant".
    pub async fn replace_scope(&self, owner: &Owner, target: &R::Target, value: R::Value) -> AppResult<R> {
        R::assemble(owner, target.clone(), value.clone())?.validate()?;

        let existing: Vec<R> = self
            .list(owner)
            .await?
            .into_iter()
            .filter(|r| r.target() == target)
            .collect();
        if existing.is_empty() {
            return Err(AppError::not_found(format!(
                "{} has no {} record for {target}",
                owner,
                R::collection()
            )));
        }

        for old in &existing {
            self.store.delete(R::collection(), old.record_id()).await?;
        }
        self.grant(owner, target.clone(), value).await
    }

    /// Issues one revoke per record of a removed-or-changed target and one
    /// grant per value of an added-or-changed target. Revokes run concurrently,
    /// then grants run concurrently, so a changed unique target never collides
    /// with its old record. Operations that succeed are not rolled back when
    /// others fail.
    pub async fn save(&self, owner: &Owner, changes: &Changeset<R::Target, BTreeSet<R::Value>>) -> AppResult<BatchOutcome> {
        let current = self.list(owner).await?;

        // Validate everything before the first write.
        let mut grants = Vec::new();
        for (target, values) in &changes.grant {
            for value in values {
                let record = R::assemble(owner, target.clone(), value.clone())?;
                record.validate()?;
                grants.push(record);
            }
        }

        let revokes: Vec<&R> = current
            .iter()
            .filter(|r| changes.revoke.contains(r.target()))
            .collect();

        let revoke_ops = revokes.iter().map(|record| async move {
            self.store
                .delete(R::collection(), record.record_id())
                .await
                .map_err(|err| (format!("revoke {}", record.target()), err))
        });
        let revoke_results = join_all(revoke_ops).await;

        let grant_ops = grants.iter().map(|record| async move {
            insert(self.store.as_ref(), record)
                .await
                .map_err(|err| (format!("grant {}", record.target()), err))
        });
        let grant_results = join_all(grant_ops).await;

        let mut failed = Vec::new();
        let mut outcome = BatchOutcome::default();
        for result in revoke_results {
            match result {
                Ok(()) => outcome.revoked += 1,
                Err((key, err)) => {
                    tracing::warn!(owner = %owner, key = %key, error = %err, "batch operation failed");
                    failed.push(key);
                }
            }
        }
        for result in grant_results {
            match result {
                Ok(_) => outcome.granted += 1,
                Err((key, err)) => {
                    tracing::warn!(owner = %owner, key = %key, error = %err, "batch operation failed");
                    failed.push(key);
                }
            }
        }

        if !failed.is_empty() {
            return Err(AppError::partial_write(failed));
        }

        tracing::info!(
            collection = %R::collection(),
            owner = %owner,
            revoked = outcome.revoked,
            granted = outcome.granted,
            "batch saved"
        );
        Ok(outcome)
    }
}

impl<R: OwnedGrant> GrantManager<R> {
    /// Save `local` over the `baseline` the caller last saw. If the stored
    /// view has moved on since, the save is refused with `Conflict` unless
    /// `overwrite` is set, in which case the stale baseline is diffed as is.
    pub async fn save_from(&self, owner: &Owner, baseline: &GrantView<R>, local: &GrantView<R>, overwrite: bool) -> AppResult<BatchOutcome> {
        if !overwrite {
            let stored = self.view(owner).await?;
            if &stored != baseline {
                return Err(AppError::conflict(format!(
                    "{} records of {owner} changed since they were loaded",
                    R::collection()
                )));
            }
        }
        self.save(owner, &diff(baseline, local)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeFeed;
    use crate::models::{ControlScope, DelegationRule, DelegationTarget, ResourceGrant, ResourceId, Scope};
    use crate::store::{Collection, MemoryStore};

    fn setup() -> (Arc<MemoryStore>, GrantManager<ResourceGrant>) {
        let store = Arc::new(MemoryStore::new(ChangeFeed::new(64)));
        let manager = GrantManager::new(store.clone());
        (store, manager)
    }

    #[tokio::test]
    async fn grant_does_not_dedup() {
        let (_, manager) = setup();
        let owner = Owner::job("J1");
        manager.grant(&owner, ResourceId::service("5"), Scope::global()).await.unwrap();
        manager.grant(&owner, ResourceId::service("5"), Scope::global()).await.unwrap();
        assert_eq!(manager.list(&owner).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn revoke_requires_ownership() {
        let (_, manager) = setup();
        let record = manager
            .grant(&Owner::job("J1"), ResourceId::service("5"), Scope::global())
            .await
            .unwrap();

        let err = manager.revoke(&Owner::job("J2"), &record.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        manager.revoke(&Owner::job("J1"), &record.id).await.unwrap();
        assert!(manager.list(&Owner::job("J1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_scope_leaves_exactly_one_new_record() {
        let (_, manager) = setup();
        let owner = Owner::user("U1");
        let target = ResourceId::page("12");
        let old = manager.grant(&owner, target.clone(), Scope::company("C1")).await.unwrap();

        let new = manager.replace_scope(&owner, &target, Scope::company("C2")).await.unwrap();

        let records = manager.list(&owner).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, new.id);
        assert_ne!(records[0].id, old.id);
        assert_eq!(records[0].scope, Scope::company("C2"));
    }

    #[tokio::test]
    async fn replace_scope_without_existing_record_is_not_found() {
        let (_, manager) = setup();
        let err = manager
            .replace_scope(&Owner::job("J1"), &ResourceId::service("1"), Scope::global())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn save_applies_diff_between_baseline_and_local() {
        let (_, manager) = setup();
        let owner = Owner::job("J1");
        manager.grant(&owner, ResourceId::service("1"), Scope::global()).await.unwrap();
        manager.grant(&owner, ResourceId::service("2"), Scope::company("C1")).await.unwrap();

        let baseline = manager.view(&owner).await.unwrap();
        let mut local = baseline.clone();
        local.remove(&ResourceId::service("1"));
        local.insert(ResourceId::service("2"), BTreeSet::from([Scope::company("C2")]));
        local.insert(ResourceId::action("3"), BTreeSet::from([Scope::global()]));

        let outcome = manager.save(&owner, &diff(&baseline, &local)).await.unwrap();
        assert_eq!(outcome, BatchOutcome { revoked: 2, granted: 2 });
        assert_eq!(manager.view(&owner).await.unwrap(), local);
    }

    #[tokio::test]
    async fn stale_baseline_is_refused_unless_overwriting() {
        let (_, manager) = setup();
        let owner = Owner::job("J1");
        let baseline = manager.view(&owner).await.unwrap();
        manager.grant(&owner, ResourceId::service("1"), Scope::global()).await.unwrap();

        let mut local = baseline.clone();
        local.insert(ResourceId::service("2"), BTreeSet::from([Scope::global()]));

        let err = manager.save_from(&owner, &baseline, &local, false).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        manager.save_from(&owner, &baseline, &local, true).await.unwrap();
        let view = manager.view(&owner).await.unwrap();
        assert!(view.contains_key(&ResourceId::service("1")));
        assert!(view.contains_key(&ResourceId::service("2")));
    }

    #[tokio::test]
    async fn partial_failure_names_failed_keys_and_keeps_successes() {
        let (store, manager) = setup();
        let owner = Owner::job("J1");
        store.reject_writes(Collection::AccessDelegations, Filter::new().eq("resource_id", "s:9"));

        let baseline = GrantView::<ResourceGrant>::new();
        let mut local = baseline.clone();
        local.insert(ResourceId::service("8"), BTreeSet::from([Scope::global()]));
        local.insert(ResourceId::service("9"), BTreeSet::from([Scope::global()]));

        let err = manager.save(&owner, &diff(&baseline, &local)).await.unwrap_err();
        match err {
            AppError::PartialWrite { failed } => assert_eq!(failed, vec!["grant s:9".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }

        let records = manager.list(&owner).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource_id, ResourceId::service("8"));
    }

    #[tokio::test]
    async fn control_rule_without_target_is_rejected_before_writing() {
        let store = Arc::new(MemoryStore::new(ChangeFeed::new(8)));
        let manager: GrantManager<DelegationRule> = GrantManager::new(store.clone());
        let owner = Owner::job("J1");

        let err = manager
            .grant(&owner, DelegationTarget::from(""), ControlScope::global())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(manager.list(&owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn control_rules_keep_multiple_scopes_per_target() {
        let store = Arc::new(MemoryStore::new(ChangeFeed::new(8)));
        let manager: GrantManager<DelegationRule> = GrantManager::new(store);
        let owner = Owner::user("U1");

        manager.grant(&owner, DelegationTarget::All, ControlScope::grantor_company()).await.unwrap();
        manager
            .grant(&owner, DelegationTarget::All, ControlScope { section_id: Some("S1".into()), ..ControlScope::default() })
            .await
            .unwrap();

        let view = manager.view(&owner).await.unwrap();
        assert_eq!(view[&DelegationTarget::All].len(), 2);
    }
}
