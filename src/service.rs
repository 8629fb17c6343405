//! Per-process resolution service.
//!
//! Owns the permission index and the four subscriptions that keep it current.
//! Every read drains whatever the feed has delivered since the previous read,
//! so a write is visible to the next check without a background task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::authz::{self, build_resource_tree, Decision, PermissionIndex, ValidScopes};
use crate::delegation::GrantManager;
use crate::errors::{AppError, AppResult};
use crate::events::{FeedEvent, Subscription};
use crate::models::{
    ActionEntity, ControlScope, DelegationRule, DelegationTarget, Distribution, JobPermission, OrgPlacement, Owner, PageEntity, ResourceGrant,
    ResourceId, ResourceNode, Scope, ServiceEntity, SubjectContext, UserException,
};
use crate::store::rpc::{GrantSpec, ReplaceJobPermissions, CLEAR_USER_EXCEPTIONS, REPLACE_JOB_PERMISSIONS};
use crate::store::{fetch, ChangeSource, Collection, Filter, LocalProcedures, RecordStore, RemoteCall, Store};

struct IndexFeeds {
    permissions: Subscription,
    exceptions: Subscription,
    delegations: Subscription,
    rules: Subscription,
    /// Events were lost and the index has not been reloaded since.
    stale: bool,
}

impl IndexFeeds {
    fn all(&mut self) -> [&mut Subscription; 4] {
        [&mut self.permissions, &mut self.exceptions, &mut self.delegations, &mut self.rules]
    }
}

pub struct AccessService {
    records: Arc<dyn RecordStore>,
    rpc: Arc<dyn RemoteCall>,
    index: RwLock<PermissionIndex>,
    feeds: Mutex<IndexFeeds>,
    root_jobs: BTreeSet<String>,
}

impl AccessService {
    /// Subscribe to the grant collections and build the index from the
    /// records they deliver first.
    pub async fn start<S: Store + 'static>(store: Arc<S>, root_jobs: BTreeSet<String>) -> AppResult<Self> {
        let records: Arc<dyn RecordStore> = store.clone();
        let source: Arc<dyn ChangeSource> = store;

        let subscribe = |collection| {
            let source = Arc::clone(&source);
            async move { source.subscribe(collection, Filter::new()).await }
        };
        let feeds = IndexFeeds {
            permissions: subscribe(Collection::JobPermissions).await?,
            exceptions: subscribe(Collection::UserExceptions).await?,
            delegations: subscribe(Collection::AccessDelegations).await?,
            rules: subscribe(Collection::ControlDelegations).await?,
            stale: false,
        };

        let service = Self {
            rpc: Arc::new(LocalProcedures::new(Arc::clone(&records))),
            records,
            index: RwLock::new(PermissionIndex::new()),
            feeds: Mutex::new(feeds),
            root_jobs,
        };
        service.sync().await?;
        tracing::info!(records = service.read_index().len(), roots = service.root_jobs.len(), "access service started");
        Ok(service)
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.records)
    }

    /// Apply every delivered change event. Falls back to a full reload when
    /// a subscription overflowed and events were lost; a failed reload is
    /// retried on the next call.
    pub async fn sync(&self) -> AppResult<usize> {
        let mut feeds = self.feeds.lock().await;

        let mut pending: Vec<(Collection, FeedEvent)> = Vec::new();
        let mut lagged = false;
        for subscription in feeds.all() {
            while let Some(event) = subscription.try_next() {
                pending.push((subscription.collection(), event));
            }
            lagged |= subscription.take_lagged();
        }

        if lagged || feeds.stale {
            feeds.stale = true;
            let fresh = PermissionIndex::load(self.records.as_ref()).await?;
            *self.write_index() = fresh;
            feeds.stale = false;
            tracing::warn!("permission index rebuilt after feed overflow");
            return Ok(pending.len());
        }

        if !pending.is_empty() {
            let mut index = self.write_index();
            for (collection, event) in &pending {
                index.apply(*collection, event);
            }
        }
        Ok(pending.len())
    }

    pub async fn indexed_records(&self) -> AppResult<usize> {
        self.sync().await?;
        Ok(self.read_index().len())
    }

    /// Brings the index up to date before a resolution. Returns `false` when
    /// the index could not be trusted; resolution then denies.
    async fn refresh_for_resolution(&self) -> bool {
        match self.sync().await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "permission index unavailable, denying");
                false
            }
        }
    }

    pub async fn resolve(&self, subject: &SubjectContext, resource: &ResourceId) -> bool {
        self.explain(subject, resource).await.is_allowed()
    }

    pub async fn explain(&self, subject: &SubjectContext, resource: &ResourceId) -> Decision {
        if !self.refresh_for_resolution().await {
            return Decision::NoGrant;
        }
        self.read_index().explain(subject, resource)
    }

    pub async fn resolve_many(&self, subject: &SubjectContext, resources: &[ResourceId]) -> BTreeMap<ResourceId, bool> {
        if !self.refresh_for_resolution().await {
            return resources.iter().map(|resource| (resource.clone(), false)).collect();
        }
        let index = self.read_index();
        resources
            .iter()
            .map(|resource| (resource.clone(), index.resolve(subject, resource)))
            .collect()
    }

    fn is_root(&self, editor: &SubjectContext) -> bool {
        let root = self.root_jobs.contains(&editor.job_id);
        if root {
            tracing::debug!(user_id = %editor.user_id, job_id = %editor.job_id, "root job bypass");
        }
        root
    }

    pub async fn can_administer(&self, editor: &SubjectContext, target: &DelegationTarget, placement: &OrgPlacement) -> AppResult<bool> {
        if self.is_root(editor) {
            return Ok(true);
        }
        self.sync().await?;
        Ok(self.read_index().can_administer(editor, target, placement))
    }

    /// Where the records of `owner` sit organizationally: one placement per
    /// distribution of a job. Users and undistributed jobs have no placement,
    /// so only rules without a scope reach them.
    pub async fn placements_of(&self, owner: &Owner) -> AppResult<Vec<OrgPlacement>> {
        let Owner::Job(job_id) = owner else {
            return Ok(vec![OrgPlacement::default()]);
        };
        let distributions: Vec<Distribution> = fetch(self.records.as_ref(), &Filter::new().eq("job_id", job_id.as_str())).await?;
        if distributions.is_empty() {
            return Ok(vec![OrgPlacement::default()]);
        }
        Ok(distributions.iter().map(Distribution::placement).collect())
    }

    /// `Forbidden` unless `editor` may administer the records of `owner`
    /// wherever they are placed. A user's records need authority over every job.
    pub async fn authorize(&self, editor: &SubjectContext, owner: &Owner) -> AppResult<()> {
        if self.is_root(editor) {
            return Ok(());
        }
        let target = match owner {
            Owner::Job(job_id) => DelegationTarget::Job(job_id.clone()),
            Owner::User(_) => DelegationTarget::All,
        };
        for placement in self.placements_of(owner).await? {
            if !self.can_administer(editor, &target, &placement).await? {
                tracing::info!(user_id = %editor.user_id, owner = %owner, ?placement, "administration denied");
                return Err(AppError::forbidden(format!("no control delegation covers {owner}")));
            }
        }
        Ok(())
    }

    /// `Forbidden` unless `editor` may give `grantor` a control rule over
    /// `target` within `scope`. Besides administering the grantor, the editor
    /// must administer the target and hold a rule at least as wide as `scope`.
    pub async fn authorize_rule(
        &self,
        editor: &SubjectContext,
        grantor: &Owner,
        target: &DelegationTarget,
        scope: &ControlScope,
    ) -> AppResult<()> {
        scope.validate()?;
        self.authorize(editor, grantor).await?;
        if self.is_root(editor) {
            return Ok(());
        }
        if let DelegationTarget::Job(job_id) = target {
            self.authorize(editor, &Owner::Job(job_id.clone())).await?;
        }

        self.sync().await?;
        if self.read_index().can_delegate(editor, grantor, target, scope) {
            return Ok(());
        }
        tracing::info!(user_id = %editor.user_id, grantor = %grantor, target = %target, "rule escalation denied");
        Err(AppError::forbidden(format!("no control delegation of yours reaches {target} with that scope")))
    }

    pub async fn tree(&self) -> AppResult<Vec<ResourceNode>> {
        let store = self.records.as_ref();
        let services: Vec<ServiceEntity> = fetch(store, &Filter::new()).await?;
        let pages: Vec<PageEntity> = fetch(store, &Filter::new()).await?;
        let actions: Vec<ActionEntity> = fetch(store, &Filter::new()).await?;
        Ok(build_resource_tree(&services, &pages, &actions))
    }

    pub async fn valid_scopes_for(&self, job_id: &str) -> AppResult<ValidScopes> {
        authz::valid_scopes_for(self.records.as_ref(), job_id).await
    }

    /// Delegated access to a job may only reach scopes that job is
    /// distributed into.
    pub async fn check_delegable(&self, owner: &Owner, scope: &Scope) -> AppResult<()> {
        let Owner::Job(job_id) = owner else {
            return Ok(());
        };
        let valid = self.valid_scopes_for(job_id).await?;
        if valid.admits(scope) {
            return Ok(());
        }
        Err(AppError::validation(format!(
            "scope {} is outside the distribution of job {job_id}",
            serde_json::to_string(scope)?
        )))
    }

    pub fn job_permissions(&self) -> GrantManager<JobPermission> {
        GrantManager::new(self.store())
    }

    pub fn user_exceptions(&self) -> GrantManager<UserException> {
        GrantManager::new(self.store())
    }

    pub fn access_delegations(&self) -> GrantManager<ResourceGrant> {
        GrantManager::new(self.store())
    }

    pub fn control_delegations(&self) -> GrantManager<DelegationRule> {
        GrantManager::new(self.store())
    }

    /// Bulk replace of a job's permission set through the elevated procedure.
    pub async fn replace_job_permissions(&self, job_id: &str, grants: Vec<GrantSpec>) -> AppResult<Value> {
        let payload = serde_json::to_value(ReplaceJobPermissions {
            job_id: job_id.to_string(),
            grants,
        })?;
        self.rpc.call(REPLACE_JOB_PERMISSIONS, payload).await
    }

    pub async fn clear_user_exceptions(&self, user_id: &str) -> AppResult<Value> {
        self.rpc.call(CLEAR_USER_EXCEPTIONS, json!({ "userId": user_id })).await
    }

    fn read_index(&self) -> RwLockReadGuard<'_, PermissionIndex> {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, PermissionIndex> {
        self.index.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
