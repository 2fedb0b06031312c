//! Postgres-backed store

use std::time::Duration;

use async_trait::async_trait;
use resumely_shared::Plan;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    ClaimOutcome, CommitOutcome, EventResolution, EventStatus, EventStore, NewWebhookEvent,
    SubscriberStore, WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::events::EventSource;
use crate::subscriptions::{Subscriber, SubscriptionState, SubscriptionStatus};

const SUBSCRIBER_COLUMNS: &str = "id, plan, status, attempt_count, cancel_effective_at, \
     billing_customer_ref, billing_subscription_ref, applied_version, revision, updated_at";

const EVENT_COLUMNS: &str = "event_id, event_type, source, sequence, payload, status, superseded, \
     subscriber_id, detail, attempts, claimed_at, last_error, received_at, processed_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriberRow {
    id: Uuid,
    plan: String,
    status: String,
    attempt_count: i32,
    cancel_effective_at: Option<OffsetDateTime>,
    billing_customer_ref: Option<String>,
    billing_subscription_ref: Option<String>,
    applied_version: Option<i64>,
    revision: i64,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriberRow> for Subscriber {
    type Error = BillingError;

    fn try_from(row: SubscriberRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| {
            BillingError::CorruptRecord(format!("subscriber {}: {}", row.id, what))
        };
        let plan: Plan = row
            .plan
            .parse()
            .map_err(|_| corrupt(&format!("unknown plan '{}'", row.plan)))?;
        let status = SubscriptionStatus::parse(&row.status)
            .ok_or_else(|| corrupt(&format!("unknown status '{}'", row.status)))?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| corrupt("negative attempt_count"))?;
        let state =
            SubscriptionState::from_parts(plan, status, attempt_count, row.cancel_effective_at)
                .ok_or_else(|| corrupt("inconsistent plan/status columns"))?;

        Ok(Subscriber {
            id: row.id,
            state,
            billing_customer_ref: row.billing_customer_ref,
            billing_subscription_ref: row.billing_subscription_ref,
            applied_version: row.applied_version,
            revision: row.revision,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: String,
    event_type: String,
    source: String,
    sequence: Option<i64>,
    payload: serde_json::Value,
    status: String,
    superseded: bool,
    subscriber_id: Option<Uuid>,
    detail: Option<String>,
    attempts: i32,
    claimed_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<EventRow> for WebhookEventRecord {
    type Error = BillingError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let status = EventStatus::parse(&row.status).ok_or_else(|| {
            BillingError::CorruptRecord(format!(
                "webhook event {}: unknown status '{}'",
                row.event_id, row.status
            ))
        })?;
        let source = EventSource::parse(&row.source).ok_or_else(|| {
            BillingError::CorruptRecord(format!(
                "webhook event {}: unknown source '{}'",
                row.event_id, row.source
            ))
        })?;

        Ok(WebhookEventRecord {
            event_id: row.event_id,
            event_type: row.event_type,
            source,
            sequence: row.sequence,
            payload: row.payload,
            status,
            superseded: row.superseded,
            subscriber_id: row.subscriber_id,
            detail: row.detail,
            attempts: row.attempts,
            claimed_at: row.claimed_at,
            last_error: row.last_error,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

fn secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> BillingError {
    move |e| {
        tracing::error!(error = %e, context, "Billing store query failed");
        BillingError::from(e)
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn claim(
        &self,
        event: &NewWebhookEvent,
        claim_timeout: Duration,
    ) -> BillingResult<ClaimOutcome> {
        // Unique-key insert is the only cross-request synchronization point.
        // A Pending row whose claim was released or went stale is taken over.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, event_type, source, sequence, payload, status, attempts, claimed_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 1, NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                claimed_at = NOW(),
                attempts = webhook_events.attempts + 1
            WHERE webhook_events.status = 'pending'
              AND (webhook_events.claimed_at IS NULL
                   OR webhook_events.claimed_at < NOW() - make_interval(secs => $6))
            RETURNING event_id
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.source.as_str())
        .bind(event.sequence)
        .bind(&event.payload)
        .bind(secs(claim_timeout))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("claim webhook event"))?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Fresh);
        }

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT status FROM webhook_events WHERE event_id = $1")
                .bind(&event.event_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("read claimed webhook event"))?;

        match existing.and_then(|(s,)| EventStatus::parse(&s)) {
            Some(status) if status.is_terminal() => Ok(ClaimOutcome::AlreadyFinished(status)),
            _ => Ok(ClaimOutcome::AlreadyClaimed),
        }
    }

    async fn release_claim(&self, event_id: &str, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET claimed_at = NULL, last_error = $2
            WHERE event_id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err("release webhook claim"))?;
        Ok(())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        resolution: &EventResolution,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, superseded = $3, subscriber_id = $4, detail = $5,
                processed_at = NOW()
            WHERE event_id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(resolution.status.as_str())
        .bind(resolution.superseded)
        .bind(resolution.subscriber_id)
        .bind(resolution.detail.as_deref())
        .execute(&self.pool)
        .await
        .map_err(db_err("finish webhook event"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM webhook_events WHERE event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get webhook event"))?;
        row.map(WebhookEventRecord::try_from).transpose()
    }

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM webhook_events
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
            EVENT_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list webhook events"))?;
        rows.into_iter().map(WebhookEventRecord::try_from).collect()
    }

    async fn list_stale_pending(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM webhook_events
            WHERE status = 'pending'
              AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $1))
            ORDER BY received_at ASC
            LIMIT $2
            "#,
            EVENT_COLUMNS
        ))
        .bind(secs(older_than))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list stale webhook events"))?;
        rows.into_iter().map(WebhookEventRecord::try_from).collect()
    }
}

#[async_trait]
impl SubscriberStore for PgStore {
    async fn create_subscriber(&self, id: Uuid) -> BillingResult<Subscriber> {
        sqlx::query("INSERT INTO subscribers (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("create subscriber"))?;
        self.get_for_update(id).await
    }

    async fn get_subscriber(&self, id: Uuid) -> BillingResult<Option<Subscriber>> {
        let row: Option<SubscriberRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscribers WHERE id = $1",
            SUBSCRIBER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get subscriber"))?;
        row.map(Subscriber::try_from).transpose()
    }

    async fn get_for_update(&self, id: Uuid) -> BillingResult<Subscriber> {
        // Plain read; the revision check in commit_transition serializes writers
        self.get_subscriber(id)
            .await?
            .ok_or(BillingError::SubscriberNotFound(id))
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Subscriber>> {
        let row: Option<SubscriberRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscribers WHERE billing_customer_ref = $1",
            SUBSCRIBER_COLUMNS
        ))
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find subscriber by customer"))?;
        row.map(Subscriber::try_from).transpose()
    }

    async fn commit_transition(
        &self,
        expected_revision: i64,
        next: &Subscriber,
        event_id: &str,
        detail: Option<&str>,
    ) -> BillingResult<CommitOutcome> {
        let attempt_count = i32::try_from(next.state.attempt_count()).map_err(|_| {
            BillingError::InvalidState(format!(
                "attempt_count {} out of range",
                next.state.attempt_count()
            ))
        })?;

        let mut tx = self.pool.begin().await.map_err(db_err("begin commit"))?;

        let row: Option<SubscriberRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscribers
            SET plan = $3, status = $4, attempt_count = $5, cancel_effective_at = $6,
                billing_customer_ref = $7, billing_subscription_ref = $8,
                applied_version = $9, revision = revision + 1, updated_at = NOW()
            WHERE id = $1 AND revision = $2
            RETURNING {}
            "#,
            SUBSCRIBER_COLUMNS
        ))
        .bind(next.id)
        .bind(expected_revision)
        .bind(next.state.plan().as_str())
        .bind(next.state.status().as_str())
        .bind(attempt_count)
        .bind(next.state.effective_at())
        .bind(next.billing_customer_ref.as_deref())
        .bind(next.billing_subscription_ref.as_deref())
        .bind(next.applied_version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("update subscriber"))?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_err("rollback commit"))?;
            return Ok(CommitOutcome::Conflict);
        };

        let marked = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'applied', superseded = FALSE, subscriber_id = $2, detail = $3,
                processed_at = NOW()
            WHERE event_id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(next.id)
        .bind(detail)
        .execute(&mut *tx)
        .await
        .map_err(db_err("mark webhook event applied"))?;

        if marked.rows_affected() != 1 {
            tx.rollback().await.map_err(db_err("rollback commit"))?;
            return Ok(CommitOutcome::EventAlreadyFinished);
        }

        tx.commit().await.map_err(db_err("commit transition"))?;
        Ok(CommitOutcome::Committed(Subscriber::try_from(row)?))
    }
}
