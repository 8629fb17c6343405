use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::events::{ChangeEvent, ChangeFeed, ChangeKind, Subscription};
use crate::store::{take_record_id, ChangeSource, Collection, Filter, Record, RecordStore};

#[derive(Debug, Default)]
struct Inner {
    rows: Vec<(Collection, Record)>,
    rejected: Vec<(Collection, Filter)>,
}

/// In-process store with the same semantics as [`super::SqliteStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    feed: ChangeFeed,
    origin: Option<Uuid>,
}

impl MemoryStore {
    pub fn new(feed: ChangeFeed) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            feed,
            origin: None,
        }
    }

    pub fn with_origin(&self, session: Uuid) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            feed: self.feed.clone(),
            origin: Some(session),
        }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Makes every later write to `collection` whose body matches `filter` fail.
    pub fn reject_writes(&self, collection: Collection, filter: Filter) {
        self.lock().rejected.push((collection, filter));
    }

    /// Publishes a `modified` event as if another writer had replaced a record.
    pub fn modify(&self, collection: Collection, id: &str, data: Value) -> AppResult<()> {
        {
            let mut inner = self.lock();
            let row = inner
                .rows
                .iter_mut()
                .find(|(c, r)| *c == collection && r.id == id)
                .ok_or_else(|| AppError::not_found(format!("{collection} record {id} not found")))?;
            row.1.data = data.clone();
        }
        self.feed.publish(ChangeEvent::new(ChangeKind::Modified, collection, id, data, self.origin));
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn unique_key(collection: Collection) -> Option<&'static str> {
    match collection {
        Collection::JobPermissions => Some("job_id"),
        Collection::UserExceptions => Some("user_id"),
        _ => None,
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn query(&self, collection: Collection, filter: &Filter) -> AppResult<Vec<Record>> {
        let inner = self.lock();
        Ok(inner
            .rows
            .iter()
            .filter(|(c, r)| *c == collection && filter.matches(&r.data))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn create(&self, collection: Collection, mut data: Value) -> AppResult<String> {
        let id = take_record_id(&mut data)?.unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let mut inner = self.lock();
            if inner.rejected.iter().any(|(c, f)| *c == collection && f.matches(&data)) {
                return Err(AppError::internal(format!("write to {collection} rejected")));
            }
            let duplicate = inner.rows.iter().any(|(c, r)| {
                *c == collection
                    && (r.id == id
                        || unique_key(collection).is_some_and(|owner| {
                            r.data.get(owner) == data.get(owner)
                                && r.data.get("resource_id") == data.get("resource_id")
                        }))
            });
            if duplicate {
                return Err(AppError::conflict(format!("{collection} record already exists")));
            }
            inner.rows.push((collection, Record { id: id.clone(), data: data.clone() }));
        }

        self.feed.publish(ChangeEvent::new(ChangeKind::Added, collection, id.clone(), data, self.origin));
        Ok(id)
    }

    async fn delete(&self, collection: Collection, id: &str) -> AppResult<()> {
        let removed = {
            let mut inner = self.lock();
            let position = inner
                .rows
                .iter()
                .position(|(c, r)| *c == collection && r.id == id)
                .ok_or_else(|| AppError::not_found(format!("{collection} record {id} not found")))?;
            if inner
                .rejected
                .iter()
                .any(|(c, f)| *c == collection && f.matches(&inner.rows[position].1.data))
            {
                return Err(AppError::internal(format!("write to {collection} rejected")));
            }
            inner.rows.remove(position).1
        };

        self.feed.publish(ChangeEvent::new(ChangeKind::Removed, collection, id, removed.data, self.origin));
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for MemoryStore {
    async fn subscribe(&self, collection: Collection, filter: Filter) -> AppResult<Subscription> {
        let subscription = self.feed.subscribe(collection, filter.clone(), self.origin);
        let existing = self.query(collection, &filter).await?;
        Ok(subscription.prime(existing))
    }
}
