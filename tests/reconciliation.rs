use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use uuid::Uuid;

use job_access::delegation::GrantManager;
use job_access::errors::AppError;
use job_access::events::ChangeFeed;
use job_access::models::{ExceptionState, JobPermission, Owner, ResourceId, Scope, UserException};
use job_access::reconcile::{ConflictChoice, EditState, SubjectEditor};
use job_access::store::{Collection, MemoryStore};

/// Two administrative sessions over one store.
fn sessions() -> (MemoryStore, MemoryStore) {
    let shared = MemoryStore::new(ChangeFeed::new(256));
    let mine = shared.with_origin(Uuid::new_v4());
    let theirs = shared.with_origin(Uuid::new_v4());
    (mine, theirs)
}

#[tokio::test]
async fn scenario_e_remote_removal_conflicts_and_discard_adopts_it() -> Result<()> {
    let (mine, theirs) = sessions();
    let user = Owner::user("U");
    let resource = ResourceId::action("3");

    let existing = GrantManager::<UserException>::new(Arc::new(theirs.clone()))
        .grant(&user, resource.clone(), ExceptionState::Denied)
        .await?;

    let mut editor = SubjectEditor::<UserException>::open(Arc::new(mine), user.clone()).await?;
    assert_eq!(editor.state(), EditState::Clean);
    assert_eq!(editor.baseline()[&resource], BTreeSet::from([ExceptionState::Denied]));

    assert_eq!(editor.set(resource.clone(), BTreeSet::from([ExceptionState::Granted])), EditState::Dirty);

    GrantManager::<UserException>::new(Arc::new(theirs))
        .revoke(&user, &existing.id)
        .await?;
    assert_eq!(editor.pump(), EditState::Conflicted);
    assert!(editor.incoming().is_some_and(|incoming| incoming.is_empty()));

    assert_eq!(editor.resolve_conflict(ConflictChoice::Discard), EditState::Clean);
    assert!(!editor.view().contains_key(&resource));
    assert!(editor.baseline().is_empty());
    Ok(())
}

#[tokio::test]
async fn pending_local_write_never_conflicts() -> Result<()> {
    let (mine, _) = sessions();
    let job = Owner::job("J");

    let existing = GrantManager::<JobPermission>::new(Arc::new(mine.clone()))
        .grant(&job, ResourceId::service("1"), Scope::global())
        .await?;

    let mut editor = SubjectEditor::<JobPermission>::open(Arc::new(mine.clone()), job.clone()).await?;
    editor.set(ResourceId::service("2"), BTreeSet::from([Scope::global()]));
    assert_eq!(editor.state(), EditState::Dirty);

    mine.modify(
        Collection::JobPermissions,
        &existing.id,
        json!({"job_id": "J", "resource_id": "s:1", "scope": {"company_id": "C1"}}),
    )?;
    assert_ne!(editor.pump(), EditState::Conflicted);
    Ok(())
}

#[tokio::test]
async fn ignored_conflict_resurfaces_on_the_next_remote_change() -> Result<()> {
    let (mine, theirs) = sessions();
    let job = Owner::job("J");
    let remote = GrantManager::<JobPermission>::new(Arc::new(theirs));

    let mut editor = SubjectEditor::<JobPermission>::open(Arc::new(mine), job.clone()).await?;
    editor.set(ResourceId::service("1"), BTreeSet::from([Scope::global()]));

    remote.grant(&job, ResourceId::service("2"), Scope::global()).await?;
    assert_eq!(editor.pump(), EditState::Conflicted);
    assert_eq!(editor.resolve_conflict(ConflictChoice::Ignore), EditState::Dirty);
    assert!(editor.baseline().is_empty());

    remote.grant(&job, ResourceId::service("3"), Scope::global()).await?;
    assert_eq!(editor.pump(), EditState::Conflicted);

    assert!(matches!(editor.save().await, Err(AppError::Conflict(_))));
    Ok(())
}

#[tokio::test]
async fn saving_returns_to_clean_and_is_observed_elsewhere() -> Result<()> {
    let (mine, theirs) = sessions();
    let user = Owner::user("U");

    let mut editor = SubjectEditor::<UserException>::open(Arc::new(mine), user.clone()).await?;
    let mut observer = SubjectEditor::<UserException>::open(Arc::new(theirs), user.clone()).await?;

    editor.set(ResourceId::service("5"), BTreeSet::from([ExceptionState::Granted]));
    let outcome = editor.save().await?;
    assert_eq!(outcome.granted, 1);
    assert_eq!(editor.pump(), EditState::Clean);

    assert_eq!(observer.pump(), EditState::Clean);
    assert_eq!(observer.view()[&ResourceId::service("5")], BTreeSet::from([ExceptionState::Granted]));
    Ok(())
}

#[tokio::test]
async fn changing_a_value_revokes_then_grants() -> Result<()> {
    let (mine, _) = sessions();
    let user = Owner::user("U");
    let manager = GrantManager::<UserException>::new(Arc::new(mine.clone()));
    manager.grant(&user, ResourceId::page("4"), ExceptionState::Denied).await?;

    let mut editor = SubjectEditor::<UserException>::open(Arc::new(mine), user.clone()).await?;
    editor.set(ResourceId::page("4"), BTreeSet::from([ExceptionState::Granted]));
    let outcome = editor.save().await?;
    assert_eq!((outcome.revoked, outcome.granted), (1, 1));

    let stored = manager.list(&user).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].state, ExceptionState::Granted);
    Ok(())
}
