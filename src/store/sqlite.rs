use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::row_parsers::record_from_row;
use crate::errors::{AppError, AppResult};
use crate::events::{ChangeEvent, ChangeFeed, ChangeKind, Subscription};
use crate::store::{take_record_id, ChangeSource, Collection, Filter, Record, RecordStore};

/// Record store over the `records` table. Cloning is cheap; clones share the
/// pool and the change feed.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    feed: ChangeFeed,
    origin: Option<Uuid>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, feed: ChangeFeed) -> Self {
        Self { pool, feed, origin: None }
    }

    /// A handle whose writes and subscriptions belong to `session`.
    pub fn with_origin(&self, session: Uuid) -> Self {
        Self {
            pool: self.pool.clone(),
            feed: self.feed.clone(),
            origin: Some(session),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    async fn fetch_data(&self, collection: Collection, id: &str) -> AppResult<Option<Value>> {
        let row = sqlx::query("SELECT id, data FROM records WHERE collection = ? AND id = ?")
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| record_from_row(&row).map(|record| record.data)).transpose()
    }
}

fn check_field(field: &str) -> AppResult<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::bad_request(format!("invalid filter field: {field}")))
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn query(&self, collection: Collection, filter: &Filter) -> AppResult<Vec<Record>> {
        let mut sql = String::from("SELECT id, data FROM records WHERE collection = ?");
        for (field, value) in filter.clauses() {
            check_field(field)?;
            if value.is_null() {
                sql.push_str(&format!(" AND json_extract(data, '$.{field}') IS NULL"));
            } else {
                sql.push_str(&format!(" AND json_extract(data, '$.{field}') = ?"));
            }
        }
        sql.push_str(" ORDER BY rowid");

        let mut query = sqlx::query(&sql).bind(collection.as_str());
        for (_, value) in filter.clauses() {
            query = match value {
                Value::Null => query,
                Value::String(s) => query.bind(s.clone()),
                Value::Bool(b) => query.bind(i64::from(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64().unwrap_or_default()),
                },
                other => {
                    return Err(AppError::bad_request(format!("unsupported filter value: {other}")));
                }
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn create(&self, collection: Collection, mut data: Value) -> AppResult<String> {
        let id = take_record_id(&mut data)?.unwrap_or_else(|| Uuid::new_v4().to_string());
        let body = serde_json::to_string(&data)?;

        let result = sqlx::query("INSERT INTO records (collection, id, data, created_at) VALUES (?, ?, ?, ?)")
            .bind(collection.as_str())
            .bind(&id)
            .bind(&body)
            .bind(Utc::now())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(AppError::conflict(format!("{collection} record already exists")));
            }
            Err(err) => return Err(err.into()),
        }

        tracing::info!(%collection, record_id = %id, origin = ?self.origin, "record created");
        self.feed.publish(ChangeEvent::new(ChangeKind::Added, collection, id.clone(), data, self.origin));
        Ok(id)
    }

    async fn delete(&self, collection: Collection, id: &str) -> AppResult<()> {
        let data = self
            .fetch_data(collection, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("{collection} record {id} not found")))?;

        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("{collection} record {id} not found")));
        }

        tracing::info!(%collection, record_id = %id, origin = ?self.origin, "record deleted");
        self.feed.publish(ChangeEvent::new(ChangeKind::Removed, collection, id, data, self.origin));
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for SqliteStore {
    async fn subscribe(&self, collection: Collection, filter: Filter) -> AppResult<Subscription> {
        // Receiver first so nothing written between the query and the subscribe is lost.
        let subscription = self.feed.subscribe(collection, filter.clone(), self.origin);
        let existing = self.query(collection, &filter).await?;
        Ok(subscription.prime(existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!().run(&pool).await.unwrap();
        SqliteStore::new(pool, ChangeFeed::new(64))
    }

    #[tokio::test]
    async fn create_query_delete() {
        let store = store().await;
        let id = store
            .create(Collection::Distributions, json!({"job_id": "J1", "company_id": "C1"}))
            .await
            .unwrap();
        store
            .create(Collection::Distributions, json!({"job_id": "J2", "company_id": "C1"}))
            .await
            .unwrap();

        let rows = store
            .query(Collection::Distributions, &Filter::new().eq("job_id", "J1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].data["company_id"], "C1");

        store.delete(Collection::Distributions, &id).await.unwrap();
        assert!(matches!(
            store.delete(Collection::Distributions, &id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn explicit_ids_are_scoped_per_collection() {
        let store = store().await;
        store.create(Collection::Services, json!({"id": "5", "label": {"en": "S"}})).await.unwrap();
        store
            .create(Collection::Pages, json!({"id": "5", "service_id": "5", "label": {"en": "P"}}))
            .await
            .unwrap();
        assert!(matches!(
            store.create(Collection::Services, json!({"id": "5", "label": {"en": "again"}})).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn job_permission_key_is_unique() {
        let store = store().await;
        let grant = json!({"job_id": "J1", "resource_id": "s:5", "scope": {}});
        store.create(Collection::JobPermissions, grant.clone()).await.unwrap();
        assert!(matches!(
            store.create(Collection::JobPermissions, grant).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn subscription_is_primed_and_tags_origin() {
        let store = store().await;
        store.create(Collection::JobPermissions, json!({"job_id": "J1", "resource_id": "s:1"})).await.unwrap();

        let session = Uuid::new_v4();
        let mine = store.with_origin(session);
        let mut sub = mine
            .subscribe(Collection::JobPermissions, Filter::new().eq("job_id", "J1"))
            .await
            .unwrap();

        let primed = sub.try_next().unwrap();
        assert_eq!(primed.kind, ChangeKind::Added);
        assert!(!primed.is_pending_local_write);

        mine.create(Collection::JobPermissions, json!({"job_id": "J1", "resource_id": "s:2"})).await.unwrap();
        store.create(Collection::JobPermissions, json!({"job_id": "J1", "resource_id": "s:3"})).await.unwrap();

        assert!(sub.try_next().unwrap().is_pending_local_write);
        assert!(!sub.try_next().unwrap().is_pending_local_write);
    }

    #[tokio::test]
    async fn rejects_injected_filter_fields() {
        let store = store().await;
        let result = store
            .query(Collection::Services, &Filter::new().eq("x') OR 1=1 --", "y"))
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }
}
