//! Event store and reconciled-state store
//!
//! Two seams: [`EventStore`] holds the webhook ledger and owns the atomic
//! per-event claim, [`SubscriberStore`] holds reconciled subscriber state
//! behind optimistic concurrency. Postgres backs both in production and
//! [`MemoryStore`] backs them in tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::EventSource;
use crate::subscriptions::Subscriber;

/// Lifecycle of a stored webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Applied,
    Ignored,
    Rejected,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Applied => "applied",
            EventStatus::Ignored => "ignored",
            EventStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "applied" => Some(EventStatus::Applied),
            "ignored" => Some(EventStatus::Ignored),
            "rejected" => Some(EventStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified envelope about to be claimed
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub source: EventSource,
    pub sequence: Option<i64>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns processing of the event
    Fresh,
    /// Another request holds a live claim
    AlreadyClaimed,
    /// The event already reached a terminal status
    AlreadyFinished(EventStatus),
}

/// Terminal outcome written for an event that did not commit a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResolution {
    pub status: EventStatus,
    pub superseded: bool,
    pub subscriber_id: Option<Uuid>,
    pub detail: Option<String>,
}

impl EventResolution {
    pub fn superseded(subscriber_id: Uuid, applied_version: i64) -> Self {
        Self {
            status: EventStatus::Applied,
            superseded: true,
            subscriber_id: Some(subscriber_id),
            detail: Some(format!("superseded by applied version {}", applied_version)),
        }
    }

    pub fn ignored(subscriber_id: Option<Uuid>, reason: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Ignored,
            superseded: false,
            subscriber_id,
            detail: Some(reason.into()),
        }
    }

    pub fn rejected(subscriber_id: Option<Uuid>, reason: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Rejected,
            superseded: false,
            subscriber_id,
            detail: Some(reason.into()),
        }
    }
}

/// Stored webhook event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub source: EventSource,
    pub sequence: Option<i64>,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub superseded: bool,
    pub subscriber_id: Option<Uuid>,
    pub detail: Option<String>,
    pub attempts: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Subscriber and event were written together
    Committed(Subscriber),
    /// The subscriber changed since it was read; nothing was written
    Conflict,
    /// The event left Pending under us (stale claim recovered elsewhere)
    EventAlreadyFinished,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically claim `event` for processing
    ///
    /// Inserts a Pending row if the id is new. An existing Pending row is
    /// re-claimed when its claim was released or is older than
    /// `claim_timeout`.
    async fn claim(&self, event: &NewWebhookEvent, claim_timeout: Duration)
        -> BillingResult<ClaimOutcome>;

    /// Give up a claim after a transient failure, leaving the event Pending
    async fn release_claim(&self, event_id: &str, error: &str) -> BillingResult<()>;

    /// Move a Pending event to a terminal status without touching subscribers
    ///
    /// Returns `false` if the event was no longer Pending.
    async fn finish_event(&self, event_id: &str, resolution: &EventResolution)
        -> BillingResult<bool>;

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Newest first
    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Pending events that nobody is actively working on
    async fn list_stale_pending(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Create a Free subscriber, or return the existing one
    async fn create_subscriber(&self, id: Uuid) -> BillingResult<Subscriber>;

    async fn get_subscriber(&self, id: Uuid) -> BillingResult<Option<Subscriber>>;

    /// Read the subscriber a transition will be computed from
    ///
    /// Fails with `SubscriberNotFound` when the id is unknown.
    async fn get_for_update(&self, id: Uuid) -> BillingResult<Subscriber>;

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Subscriber>>;

    /// Write `next` and mark `event_id` Applied in one atomic step
    ///
    /// Succeeds only if the stored revision still equals `expected_revision`.
    async fn commit_transition(
        &self,
        expected_revision: i64,
        next: &Subscriber,
        event_id: &str,
        detail: Option<&str>,
    ) -> BillingResult<CommitOutcome>;
}

/// Everything the reconciler needs from storage
pub trait ReconcilerStore: EventStore + SubscriberStore {}

impl<T: EventStore + SubscriberStore + ?Sized> ReconcilerStore for T {}
