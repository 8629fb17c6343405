use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;

use job_access::authz::Decision;
use job_access::events::ChangeFeed;
use job_access::models::{ExceptionState, Owner, ResourceId, Scope, SubjectContext};
use job_access::service::AccessService;
use job_access::store::MemoryStore;

async fn service() -> Result<AccessService> {
    let store = Arc::new(MemoryStore::new(ChangeFeed::new(256)));
    Ok(AccessService::start(store, BTreeSet::new()).await?)
}

fn contexts() -> Vec<SubjectContext> {
    vec![
        SubjectContext::new("U", "J"),
        SubjectContext::new("U", "J").in_company("C1"),
        SubjectContext::new("U", "J").in_company("C2").in_section("S9"),
    ]
}

#[tokio::test]
async fn scenario_a_no_grant_no_exception_is_denied() -> Result<()> {
    let service = service().await?;
    let resource = ResourceId::service("5");

    assert!(!service.resolve(&SubjectContext::new("U", "J"), &resource).await);
    assert_eq!(service.explain(&SubjectContext::new("U", "J"), &resource).await, Decision::NoGrant);
    Ok(())
}

#[tokio::test]
async fn scenario_b_unscoped_grant_allows_in_every_context() -> Result<()> {
    let service = service().await?;
    let resource = ResourceId::service("5");
    service.job_permissions().grant(&Owner::job("J"), resource.clone(), Scope::global()).await?;

    for ctx in contexts() {
        assert!(service.resolve(&ctx, &resource).await, "denied in {:?}", ctx);
    }
    Ok(())
}

#[tokio::test]
async fn scenario_c_company_scope_follows_context() -> Result<()> {
    let service = service().await?;
    let resource = ResourceId::page("12");
    service.job_permissions().grant(&Owner::job("J"), resource.clone(), Scope::company("C1")).await?;

    let elsewhere = SubjectContext::new("U", "J").in_company("C2");
    assert!(!service.resolve(&elsewhere, &resource).await);
    assert_eq!(service.explain(&elsewhere, &resource).await, Decision::ScopeMismatch);

    let inside = SubjectContext::new("U", "J").in_company("C1");
    assert!(service.resolve(&inside, &resource).await);
    Ok(())
}

#[tokio::test]
async fn scenario_d_denied_exception_beats_unscoped_grant() -> Result<()> {
    let service = service().await?;
    let resource = ResourceId::service("5");
    service.job_permissions().grant(&Owner::job("J"), resource.clone(), Scope::global()).await?;
    service.user_exceptions().grant(&Owner::user("U"), resource.clone(), ExceptionState::Denied).await?;

    for ctx in contexts() {
        assert!(!service.resolve(&ctx, &resource).await);
    }
    assert_eq!(service.explain(&SubjectContext::new("U", "J"), &resource).await, Decision::ExceptionDenied);
    Ok(())
}

#[tokio::test]
async fn denied_exception_beats_delegated_access() -> Result<()> {
    let service = service().await?;
    let resource = ResourceId::action("3");
    service.access_delegations().grant(&Owner::user("U"), resource.clone(), Scope::global()).await?;
    service.access_delegations().grant(&Owner::job("J"), resource.clone(), Scope::global()).await?;
    service.user_exceptions().grant(&Owner::user("U"), resource.clone(), ExceptionState::Denied).await?;

    assert!(!service.resolve(&SubjectContext::new("U", "J"), &resource).await);
    Ok(())
}

#[tokio::test]
async fn granted_exception_allows_without_job_grant() -> Result<()> {
    let service = service().await?;
    let resource = ResourceId::action("3");
    service.user_exceptions().grant(&Owner::user("U"), resource.clone(), ExceptionState::Granted).await?;

    assert!(service.resolve(&SubjectContext::new("U", "J"), &resource).await);
    assert!(!service.resolve(&SubjectContext::new("OTHER", "J"), &resource).await);
    Ok(())
}

#[tokio::test]
async fn scope_match_is_conjunctive() -> Result<()> {
    let service = service().await?;
    let resource = ResourceId::page("7");
    service
        .job_permissions()
        .grant(&Owner::job("J"), resource.clone(), Scope::company("C1").with_section("Sec1"))
        .await?;

    let both = SubjectContext::new("U", "J").in_company("C1").in_section("Sec1");
    let wrong_section = SubjectContext::new("U", "J").in_company("C1").in_section("Sec2");
    let wrong_company = SubjectContext::new("U", "J").in_company("C2").in_section("Sec1");
    let missing_section = SubjectContext::new("U", "J").in_company("C1");

    assert!(service.resolve(&both, &resource).await);
    assert!(!service.resolve(&wrong_section, &resource).await);
    assert!(!service.resolve(&wrong_company, &resource).await);
    assert!(!service.resolve(&missing_section, &resource).await);
    Ok(())
}

#[tokio::test]
async fn delegations_act_like_native_grants() -> Result<()> {
    let service = service().await?;
    let job_delegated = ResourceId::service("20");
    let user_delegated = ResourceId::service("21");
    service.access_delegations().grant(&Owner::job("J"), job_delegated.clone(), Scope::company("C1")).await?;
    service.access_delegations().grant(&Owner::user("U"), user_delegated.clone(), Scope::global()).await?;

    let subject = SubjectContext::new("U", "J").in_company("C1");
    assert_eq!(service.explain(&subject, &job_delegated).await, Decision::JobGrant);
    assert_eq!(service.explain(&subject, &user_delegated).await, Decision::UserDelegation);

    let colleague = SubjectContext::new("U2", "J").in_company("C1");
    assert!(service.resolve(&colleague, &job_delegated).await);
    assert!(!service.resolve(&colleague, &user_delegated).await);
    Ok(())
}

#[tokio::test]
async fn child_grant_without_parent_is_honored() -> Result<()> {
    let service = service().await?;
    service.job_permissions().grant(&Owner::job("J"), ResourceId::action("3"), Scope::global()).await?;

    let subject = SubjectContext::new("U", "J");
    let results = service
        .resolve_many(&subject, &[ResourceId::service("1"), ResourceId::action("3")])
        .await;
    assert!(!results[&ResourceId::service("1")]);
    assert!(results[&ResourceId::action("3")]);
    Ok(())
}

#[tokio::test]
async fn unknown_subjects_and_resources_are_denied() -> Result<()> {
    let service = service().await?;
    service.job_permissions().grant(&Owner::job("J"), ResourceId::service("5"), Scope::global()).await?;

    assert!(!service.resolve(&SubjectContext::new("", ""), &ResourceId::service("5")).await);
    assert!(!service.resolve(&SubjectContext::new("U", "J"), &ResourceId::service("404")).await);
    Ok(())
}

#[tokio::test]
async fn revoking_a_grant_takes_effect_on_the_next_check() -> Result<()> {
    let service = service().await?;
    let resource = ResourceId::service("5");
    let grant = service.job_permissions().grant(&Owner::job("J"), resource.clone(), Scope::global()).await?;
    let subject = SubjectContext::new("U", "J");
    assert!(service.resolve(&subject, &resource).await);

    service.job_permissions().revoke(&Owner::job("J"), &grant.id).await?;
    assert!(!service.resolve(&subject, &resource).await);
    Ok(())
}
