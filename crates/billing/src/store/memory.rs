//! In-memory store used by tests and local tooling

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ClaimOutcome, CommitOutcome, EventResolution, EventStatus, EventStore, NewWebhookEvent,
    SubscriberStore, WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::Subscriber;

/// Both tables behind one lock, so a commit is atomic across them
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    subscribers: HashMap<Uuid, Subscriber>,
    events: HashMap<String, WebhookEventRecord>,
    /// Insertion order of event ids
    received: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a subscriber verbatim (test setup)
    pub async fn put_subscriber(&self, subscriber: Subscriber) {
        let mut tables = self.inner.lock().await;
        tables.subscribers.insert(subscriber.id, subscriber);
    }

    /// Age a claim so it looks abandoned (test setup)
    pub async fn backdate_claim(&self, event_id: &str, by: Duration) {
        let mut tables = self.inner.lock().await;
        if let Some(event) = tables.events.get_mut(event_id) {
            event.claimed_at = event.claimed_at.map(|at| at - by);
        }
    }

    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }
}

fn is_stale(claimed_at: Option<OffsetDateTime>, older_than: Duration, now: OffsetDateTime) -> bool {
    match claimed_at {
        None => true,
        Some(at) => at < now - older_than,
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn claim(
        &self,
        event: &NewWebhookEvent,
        claim_timeout: Duration,
    ) -> BillingResult<ClaimOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.inner.lock().await;

        if let Some(existing) = tables.events.get_mut(&event.event_id) {
            if existing.status.is_terminal() {
                return Ok(ClaimOutcome::AlreadyFinished(existing.status));
            }
            if !is_stale(existing.claimed_at, claim_timeout, now) {
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
            existing.claimed_at = Some(now);
            existing.attempts += 1;
            return Ok(ClaimOutcome::Fresh);
        }

        tables.events.insert(
            event.event_id.clone(),
            WebhookEventRecord {
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                source: event.source,
                sequence: event.sequence,
                payload: event.payload.clone(),
                status: EventStatus::Pending,
                superseded: false,
                subscriber_id: None,
                detail: None,
                attempts: 1,
                claimed_at: Some(now),
                last_error: None,
                received_at: now,
                processed_at: None,
            },
        );
        tables.received.push(event.event_id.clone());
        Ok(ClaimOutcome::Fresh)
    }

    async fn release_claim(&self, event_id: &str, error: &str) -> BillingResult<()> {
        let mut tables = self.inner.lock().await;
        if let Some(event) = tables.events.get_mut(event_id) {
            if event.status == EventStatus::Pending {
                event.claimed_at = None;
                event.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        resolution: &EventResolution,
    ) -> BillingResult<bool> {
        let mut tables = self.inner.lock().await;
        let Some(event) = tables.events.get_mut(event_id) else {
            return Ok(false);
        };
        if event.status.is_terminal() {
            return Ok(false);
        }
        event.status = resolution.status;
        event.superseded = resolution.superseded;
        event.subscriber_id = resolution.subscriber_id;
        event.detail = resolution.detail.clone();
        event.processed_at = Some(OffsetDateTime::now_utc());
        Ok(true)
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.inner.lock().await.events.get(event_id).cloned())
    }

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .received
            .iter()
            .rev()
            .filter_map(|id| tables.events.get(id))
            .filter(|e| status.map_or(true, |s| e.status == s))
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn list_stale_pending(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let now = OffsetDateTime::now_utc();
        let tables = self.inner.lock().await;
        Ok(tables
            .received
            .iter()
            .filter_map(|id| tables.events.get(id))
            .filter(|e| e.status == EventStatus::Pending && is_stale(e.claimed_at, older_than, now))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn create_subscriber(&self, id: Uuid) -> BillingResult<Subscriber> {
        let mut tables = self.inner.lock().await;
        Ok(tables
            .subscribers
            .entry(id)
            .or_insert_with(|| Subscriber::new_free(id))
            .clone())
    }

    async fn get_subscriber(&self, id: Uuid) -> BillingResult<Option<Subscriber>> {
        Ok(self.inner.lock().await.subscribers.get(&id).cloned())
    }

    async fn get_for_update(&self, id: Uuid) -> BillingResult<Subscriber> {
        self.get_subscriber(id)
            .await?
            .ok_or(BillingError::SubscriberNotFound(id))
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Subscriber>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .subscribers
            .values()
            .find(|s| s.billing_customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn commit_transition(
        &self,
        expected_revision: i64,
        next: &Subscriber,
        event_id: &str,
        detail: Option<&str>,
    ) -> BillingResult<CommitOutcome> {
        let mut tables = self.inner.lock().await;

        let Some(stored) = tables.subscribers.get(&next.id) else {
            return Err(BillingError::SubscriberNotFound(next.id));
        };
        if stored.revision != expected_revision {
            return Ok(CommitOutcome::Conflict);
        }
        if let Some(customer_ref) = next.billing_customer_ref.as_deref() {
            let taken = tables
                .subscribers
                .values()
                .any(|s| s.id != next.id && s.billing_customer_ref.as_deref() == Some(customer_ref));
            if taken {
                return Err(BillingError::InvalidState(format!(
                    "billing_customer_ref {} already belongs to another subscriber",
                    customer_ref
                )));
            }
        }
        match tables.events.get(event_id) {
            Some(event) if event.status == EventStatus::Pending => {}
            _ => return Ok(CommitOutcome::EventAlreadyFinished),
        }

        let now = OffsetDateTime::now_utc();
        let mut committed = next.clone();
        committed.revision = expected_revision + 1;
        committed.updated_at = now;
        tables.subscribers.insert(committed.id, committed.clone());

        if let Some(event) = tables.events.get_mut(event_id) {
            event.status = EventStatus::Applied;
            event.superseded = false;
            event.subscriber_id = Some(committed.id);
            event.detail = detail.map(str::to_string);
            event.processed_at = Some(now);
        }

        Ok(CommitOutcome::Committed(committed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSource;

    fn new_event(id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            event_id: id.to_string(),
            event_type: "invoice.payment_failed".to_string(),
            source: EventSource::Provider,
            sequence: Some(1),
            payload: serde_json::json!({"id": id}),
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1800);

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let event = new_event("evt_1");

        assert_eq!(store.claim(&event, TIMEOUT).await.unwrap(), ClaimOutcome::Fresh);
        assert_eq!(
            store.claim(&event, TIMEOUT).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );

        store.release_claim("evt_1", "database timeout").await.unwrap();
        assert_eq!(store.claim(&event, TIMEOUT).await.unwrap(), ClaimOutcome::Fresh);

        let record = store.get_event("evt_1").await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_error.as_deref(), Some("database timeout"));
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_recoverable() {
        let store = MemoryStore::new();
        let event = new_event("evt_1");
        store.claim(&event, TIMEOUT).await.unwrap();
        store.backdate_claim("evt_1", Duration::from_secs(3600)).await;

        let stale = store.list_stale_pending(TIMEOUT, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(store.claim(&event, TIMEOUT).await.unwrap(), ClaimOutcome::Fresh);
    }

    #[tokio::test]
    async fn test_finished_event_cannot_be_reclaimed() {
        let store = MemoryStore::new();
        let event = new_event("evt_1");
        store.claim(&event, TIMEOUT).await.unwrap();
        assert!(store
            .finish_event("evt_1", &EventResolution::ignored(None, "unhandled"))
            .await
            .unwrap());

        assert_eq!(
            store.claim(&event, TIMEOUT).await.unwrap(),
            ClaimOutcome::AlreadyFinished(EventStatus::Ignored)
        );
        assert!(!store
            .finish_event("evt_1", &EventResolution::rejected(None, "late"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_commit_requires_matching_revision() {
        let store = MemoryStore::new();
        let subscriber = store.create_subscriber(Uuid::new_v4()).await.unwrap();
        store.claim(&new_event("evt_1"), TIMEOUT).await.unwrap();

        assert_eq!(
            store
                .commit_transition(7, &subscriber, "evt_1", None)
                .await
                .unwrap(),
            CommitOutcome::Conflict
        );

        let outcome = store
            .commit_transition(0, &subscriber, "evt_1", Some("ok"))
            .await
            .unwrap();
        let CommitOutcome::Committed(committed) = outcome else {
            panic!("expected commit");
        };
        assert_eq!(committed.revision, 1);

        let record = store.get_event("evt_1").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Applied);
        assert_eq!(record.subscriber_id, Some(subscriber.id));
    }

    #[tokio::test]
    async fn test_list_events_filters_and_orders_newest_first() {
        let store = MemoryStore::new();
        for id in ["evt_1", "evt_2", "evt_3"] {
            store.claim(&new_event(id), TIMEOUT).await.unwrap();
        }
        store
            .finish_event("evt_2", &EventResolution::rejected(None, "bad plan"))
            .await
            .unwrap();

        let all = store.list_events(None, 10, 0).await.unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["evt_3", "evt_2", "evt_1"]);

        let rejected = store
            .list_events(Some(EventStatus::Rejected), 10, 0)
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].event_id, "evt_2");
    }
}
