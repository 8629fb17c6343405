use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::delegation::{project, BatchOutcome, GrantManager, GrantView, OwnedGrant};
use crate::errors::{AppError, AppResult};
use crate::events::{ChangeKind, FeedEvent, Subscription};
use crate::models::Owner;
use crate::reconcile::{ConflictChoice, EditSession, EditState};
use crate::store::{ChangeSource, Record, RecordStore, Store, StoredRecord};

/// Edit session for one owner's grants, kept in sync with the change feed.
///
/// The editor mirrors the owner's stored records in `cache`; every feed event
/// updates the mirror and hands the resulting snapshot to the state machine.
pub struct SubjectEditor<R: OwnedGrant> {
    source: Arc<dyn ChangeSource>,
    manager: GrantManager<R>,
    owner: Owner,
    subscription: Subscription,
    cache: BTreeMap<String, R>,
    session: EditSession<GrantView<R>>,
}

impl<R: OwnedGrant> SubjectEditor<R> {
    pub async fn open<S: Store + 'static>(store: Arc<S>, owner: Owner) -> AppResult<Self> {
        let records: Arc<dyn RecordStore> = store.clone();
        let source: Arc<dyn ChangeSource> = store;
        let subscription = source.subscribe(R::collection(), R::owner_filter(&owner)?).await?;

        let mut editor = Self {
            source,
            manager: GrantManager::new(records),
            owner,
            subscription,
            cache: BTreeMap::new(),
            session: EditSession::new(GrantView::<R>::new()),
        };
        editor.pump();
        Ok(editor)
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn state(&self) -> EditState {
        self.session.state()
    }

    pub fn view(&self) -> &GrantView<R> {
        self.session.local()
    }

    pub fn baseline(&self) -> &GrantView<R> {
        self.session.baseline()
    }

    pub fn incoming(&self) -> Option<&GrantView<R>> {
        self.session.incoming()
    }

    /// Apply every event already delivered, without waiting.
    pub fn pump(&mut self) -> EditState {
        while let Some(event) = self.subscription.try_next() {
            self.apply(event);
        }
        self.session.state()
    }

    /// Wait for one more event. `None` once the subscription has ended.
    pub async fn next_change(&mut self) -> Option<EditState> {
        let event = self.subscription.next().await?;
        Some(self.apply(event))
    }

    pub fn edit(&mut self, f: impl FnOnce(&mut GrantView<R>)) -> EditState {
        self.session.edit(f)
    }

    /// Set the values for one target; an empty set removes the target.
    pub fn set(&mut self, target: R::Target, values: BTreeSet<R::Value>) -> EditState {
        self.session.edit(|view| {
            if values.is_empty() {
                view.remove(&target);
            } else {
                view.insert(target, values);
            }
        })
    }

    pub fn resolve_conflict(&mut self, choice: ConflictChoice) -> EditState {
        tracing::info!(owner = %self.owner, ?choice, "conflict resolved");
        self.session.on_conflict(choice)
    }

    pub fn discard(&mut self) -> EditState {
        self.session.discard()
    }

    /// Write the pending changes. On failure the local view is kept and the
    /// session stays dirty so the operator can retry.
    pub async fn save(&mut self) -> AppResult<BatchOutcome> {
        if self.session.state() == EditState::Conflicted {
            return Err(AppError::conflict(format!(
                "{} changed remotely; discard or ignore before saving",
                self.owner
            )));
        }

        let changes = self.session.changeset();
        if changes.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let outcome = self.manager.save(&self.owner, &changes).await?;
        self.session.mark_saved();
        Ok(outcome)
    }

    /// Switch to another owner. Unsaved edits for the previous one are dropped.
    pub async fn select(&mut self, owner: Owner) -> AppResult<EditState> {
        let subscription = self
            .source
            .subscribe(R::collection(), R::owner_filter(&owner)?)
            .await?;

        if self.session.state() != EditState::Clean {
            tracing::debug!(previous = %self.owner, "abandoning unsaved edits");
        }
        self.subscription.unsubscribe();
        self.subscription = subscription;
        self.owner = owner;
        self.cache.clear();
        self.session = EditSession::new(GrantView::<R>::new());
        Ok(self.pump())
    }

    pub fn close(&mut self) {
        self.subscription.unsubscribe();
    }

    fn apply(&mut self, event: FeedEvent) -> EditState {
        let pending = event.is_pending_local_write;
        let mut touched: Vec<R::Target> = Vec::new();
        let previous = match event.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let record = Record {
                    id: event.id.clone(),
                    data: event.data,
                };
                match R::from_record(&record) {
                    Ok(parsed) => {
                        touched.push(parsed.target().clone());
                        self.cache.insert(event.id, parsed)
                    }
                    Err(err) => {
                        tracing::warn!(owner = %self.owner, record_id = %event.id, error = %err, "skipping unreadable record");
                        self.cache.remove(&event.id)
                    }
                }
            }
            ChangeKind::Removed => self.cache.remove(&event.id),
        };
        if let Some(previous) = previous {
            touched.push(previous.target().clone());
        }

        let snapshot = project(self.cache.values());
        if pending {
            self.session.on_local_echo(&touched, snapshot)
        } else {
            self.session.on_remote_snapshot(snapshot, false)
        }
    }
}

impl<R: OwnedGrant> Drop for SubjectEditor<R> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeFeed;
    use crate::models::{ExceptionState, ResourceId, UserException};
    use crate::store::{Collection, Filter, MemoryStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn opens_clean_with_existing_records() {
        let store = Arc::new(MemoryStore::new(ChangeFeed::new(64)));
        GrantManager::<UserException>::new(store.clone())
            .grant(&Owner::user("U1"), ResourceId::service("1"), ExceptionState::Denied)
            .await
            .unwrap();

        let editor = SubjectEditor::<UserException>::open(store, Owner::user("U1")).await.unwrap();
        assert_eq!(editor.state(), EditState::Clean);
        assert_eq!(editor.view()[&ResourceId::service("1")], BTreeSet::from([ExceptionState::Denied]));
    }

    #[tokio::test]
    async fn own_save_echo_does_not_conflict() {
        let shared = MemoryStore::new(ChangeFeed::new(64));
        let mine = Arc::new(shared.with_origin(Uuid::new_v4()));
        let mut editor = SubjectEditor::<UserException>::open(mine, Owner::user("U1")).await.unwrap();

        editor.set(ResourceId::page("4"), BTreeSet::from([ExceptionState::Granted]));
        editor.save().await.unwrap();
        assert_eq!(editor.pump(), EditState::Clean);
        assert!(editor.view().contains_key(&ResourceId::page("4")));
    }

    #[tokio::test]
    async fn failed_save_stays_dirty_and_retry_sends_only_the_rest() {
        let shared = MemoryStore::new(ChangeFeed::new(64));
        let mine = Arc::new(shared.with_origin(Uuid::new_v4()));
        let mut editor = SubjectEditor::<UserException>::open(mine, Owner::user("U1")).await.unwrap();

        shared.reject_writes(Collection::UserExceptions, Filter::new().eq("resource_id", "s:2"));
        editor.set(ResourceId::service("1"), BTreeSet::from([ExceptionState::Granted]));
        editor.set(ResourceId::service("2"), BTreeSet::from([ExceptionState::Denied]));

        assert!(matches!(editor.save().await, Err(AppError::PartialWrite { .. })));
        assert_eq!(editor.pump(), EditState::Dirty);
        assert!(editor.view().contains_key(&ResourceId::service("2")));
        assert!(editor.baseline().contains_key(&ResourceId::service("1")));
    }

    #[tokio::test]
    async fn retry_after_ignored_conflict_keeps_the_remote_record() {
        let shared = MemoryStore::new(ChangeFeed::new(64));
        let mine = Arc::new(shared.with_origin(Uuid::new_v4()));
        let theirs = Arc::new(shared.with_origin(Uuid::new_v4()));
        let mut editor = SubjectEditor::<UserException>::open(mine, Owner::user("U1")).await.unwrap();

        editor.set(ResourceId::service("1"), BTreeSet::from([ExceptionState::Granted]));
        editor.set(ResourceId::service("2"), BTreeSet::from([ExceptionState::Denied]));
        GrantManager::<UserException>::new(theirs)
            .grant(&Owner::user("U1"), ResourceId::service("9"), ExceptionState::Denied)
            .await
            .unwrap();
        assert_eq!(editor.pump(), EditState::Conflicted);
        assert_eq!(editor.resolve_conflict(ConflictChoice::Ignore), EditState::Dirty);

        shared.reject_writes(Collection::UserExceptions, Filter::new().eq("resource_id", "s:2"));
        assert!(matches!(editor.save().await, Err(AppError::PartialWrite { .. })));
        assert_eq!(editor.pump(), EditState::Dirty);

        assert!(editor.baseline().contains_key(&ResourceId::service("1")));
        assert!(!editor.baseline().contains_key(&ResourceId::service("9")));
        let changes = editor.session.changeset();
        assert!(changes.revoke.is_empty());
        assert_eq!(changes.grant.len(), 1);
    }

    #[tokio::test]
    async fn select_resets_to_the_new_owner() {
        let store = Arc::new(MemoryStore::new(ChangeFeed::new(64)));
        let mut editor = SubjectEditor::<UserException>::open(store.clone(), Owner::user("U1")).await.unwrap();
        editor.set(ResourceId::service("1"), BTreeSet::from([ExceptionState::Granted]));
        assert_eq!(editor.state(), EditState::Dirty);

        assert_eq!(editor.select(Owner::user("U2")).await.unwrap(), EditState::Clean);
        assert!(editor.view().is_empty());

        // Writes for the previous owner are no longer observed.
        GrantManager::<UserException>::new(store)
            .grant(&Owner::user("U1"), ResourceId::service("7"), ExceptionState::Denied)
            .await
            .unwrap();
        assert!(editor.pump() == EditState::Clean && editor.view().is_empty());
    }
}
