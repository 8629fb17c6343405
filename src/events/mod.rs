//! Push-based change feed over a broadcast channel.
//!
//! Every successful store write publishes a [`ChangeEvent`]. Subscribers see
//! only the events of one collection that match their filter, with
//! `is_pending_local_write` set when the write came from their own session.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

use crate::store::{Collection, Filter, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub kind: ChangeKind,
    pub collection: Collection,
    pub record_id: String,
    pub data: Value,
    /// Session that performed the write, if any.
    pub origin: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, collection: Collection, record_id: impl Into<String>, data: Value, origin: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            collection,
            record_id: record_id.into(),
            data,
            origin,
            occurred_at: Utc::now(),
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub kind: ChangeKind,
    pub id: String,
    pub data: Value,
    pub is_pending_local_write: bool,
}

#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire and forget; having no subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        tracing::debug!(
            collection = %event.collection,
            record_id = %event.record_id,
            kind = ?event.kind,
            "change published"
        );
        let _ = self.tx.send(event);
    }

    /// Open a live subscription. Call [`Subscription::prime`] with the records
    /// that existed at subscribe time to deliver them as `added` events first.
    pub fn subscribe(&self, collection: Collection, filter: Filter, session: Option<Uuid>) -> Subscription {
        Subscription {
            rx: Some(self.tx.subscribe()),
            collection,
            filter,
            session,
            primed: VecDeque::new(),
            lagged: false,
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[derive(Debug)]
pub struct Subscription {
    rx: Option<broadcast::Receiver<ChangeEvent>>,
    collection: Collection,
    filter: Filter,
    session: Option<Uuid>,
    primed: VecDeque<FeedEvent>,
    lagged: bool,
}

impl Subscription {
    pub fn prime(mut self, records: Vec<Record>) -> Self {
        self.primed.extend(records.into_iter().map(|record| FeedEvent {
            kind: ChangeKind::Added,
            id: record.id,
            data: record.data,
            is_pending_local_write: false,
        }));
        self
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    /// Wait for the next matching event. Returns `None` once unsubscribed or
    /// once the feed is gone.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        if self.rx.is_none() {
            return None;
        }
        if let Some(event) = self.primed.pop_front() {
            return Some(event);
        }

        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(collection = %self.collection, skipped, "change feed subscriber lagged");
                    self.lagged = true;
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Non-blocking variant of [`Subscription::next`].
    pub fn try_next(&mut self) -> Option<FeedEvent> {
        if self.rx.is_none() {
            return None;
        }
        if let Some(event) = self.primed.pop_front() {
            return Some(event);
        }

        loop {
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(collection = %self.collection, skipped, "change feed subscriber lagged");
                    self.lagged = true;
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Whether events were dropped since the last call. A consumer that
    /// caches state should rebuild it from the store when this is true.
    pub fn take_lagged(&mut self) -> bool {
        std::mem::take(&mut self.lagged)
    }

    /// Safe to call repeatedly; no event is delivered afterwards.
    pub fn unsubscribe(&mut self) {
        self.rx = None;
        self.primed.clear();
    }

    fn accept(&self, event: ChangeEvent) -> Option<FeedEvent> {
        if event.collection != self.collection || !self.filter.matches(&event.data) {
            return None;
        }
        let is_pending_local_write = matches!((self.session, event.origin), (Some(mine), Some(origin)) if mine == origin);
        Some(FeedEvent {
            kind: event.kind,
            id: event.record_id,
            data: event.data,
            is_pending_local_write,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_sees_only_matching_events() {
        let feed = ChangeFeed::new(16);
        let mut sub = feed.subscribe(Collection::JobPermissions, Filter::new().eq("job_id", "J1"), None);

        feed.publish(ChangeEvent::new(ChangeKind::Added, Collection::JobPermissions, "a", json!({"job_id": "J2"}), None));
        feed.publish(ChangeEvent::new(ChangeKind::Added, Collection::UserExceptions, "b", json!({"job_id": "J1"}), None));
        feed.publish(ChangeEvent::new(ChangeKind::Added, Collection::JobPermissions, "c", json!({"job_id": "J1"}), None));

        let event = sub.next().await.unwrap();
        assert_eq!(event.id, "c");
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn own_session_writes_are_flagged_pending() {
        let feed = ChangeFeed::new(16);
        let session = Uuid::new_v4();
        let mut sub = feed.subscribe(Collection::JobPermissions, Filter::new(), Some(session));

        feed.publish(ChangeEvent::new(ChangeKind::Added, Collection::JobPermissions, "mine", json!({}), Some(session)));
        feed.publish(ChangeEvent::new(ChangeKind::Added, Collection::JobPermissions, "theirs", json!({}), Some(Uuid::new_v4())));

        assert!(sub.try_next().unwrap().is_pending_local_write);
        assert!(!sub.try_next().unwrap().is_pending_local_write);
    }

    #[tokio::test]
    async fn overflow_is_reported_once() {
        let feed = ChangeFeed::new(2);
        let mut sub = feed.subscribe(Collection::Pages, Filter::new(), None);
        for i in 0..5 {
            feed.publish(ChangeEvent::new(ChangeKind::Added, Collection::Pages, i.to_string(), json!({}), None));
        }

        let mut seen = 0;
        while sub.try_next().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 2);
        assert!(sub.take_lagged());
        assert!(!sub.take_lagged());
    }

    #[tokio::test]
    async fn primed_records_come_first_and_unsubscribe_stops_delivery() {
        let feed = ChangeFeed::new(16);
        let mut sub = feed
            .subscribe(Collection::Distributions, Filter::new(), None)
            .prime(vec![Record { id: "existing".into(), data: json!({}) }]);

        feed.publish(ChangeEvent::new(ChangeKind::Added, Collection::Distributions, "live", json!({}), None));

        assert_eq!(sub.try_next().unwrap().id, "existing");
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(sub.try_next().is_none());
        assert!(sub.next().await.is_none());
        assert!(!sub.is_active());
    }
}
