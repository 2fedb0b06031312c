//! Webhook reconciliation
//!
//! verify -> claim -> classify -> resolve subscriber -> transition -> commit.
//! The claim is the only cross-request synchronization point for an event
//! id; per-subscriber writes are serialized by the revision check in
//! [`SubscriberStore::commit_transition`](crate::store::SubscriberStore).

use std::sync::Arc;
use std::time::Duration;

use resumely_shared::Plan;
use serde::Serialize;
use uuid::Uuid;

use crate::alerts::{AlertSink, OperatorAlert};
use crate::config::{BillingConfig, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::events::{classify, BillingEvent, Classification, EventSource, WebhookEnvelope};
use crate::signature::{VerificationError, WebhookVerifier};
use crate::store::{
    ClaimOutcome, CommitOutcome, EventResolution, EventStatus, EventStore, NewWebhookEvent,
    ReconcilerStore, SubscriberStore, WebhookEventRecord,
};
use crate::subscriptions::{
    transition, Effect, Entitlement, Subscriber, SubscriptionStatus, Transition,
};

/// What happened to one delivered envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        subscriber_id: Uuid,
        plan: Plan,
        status: SubscriptionStatus,
        effects: Vec<Effect>,
    },
    /// Recorded as Applied-but-superseded; state untouched
    Superseded {
        subscriber_id: Uuid,
        applied_version: i64,
    },
    /// Event id already reached a terminal status
    Duplicate { status: EventStatus },
    /// Another request currently holds the claim
    InFlight,
    Ignored { reason: String },
    /// Dead-lettered for operator review
    Rejected { reason: String },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied { .. } => "applied",
            ReconcileOutcome::Superseded { .. } => "superseded",
            ReconcileOutcome::Duplicate { .. } => "duplicate",
            ReconcileOutcome::InFlight => "in_flight",
            ReconcileOutcome::Ignored { .. } => "ignored",
            ReconcileOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// Result of re-running one stored Pending event
#[derive(Debug, Clone, Serialize)]
pub struct ReprocessResult {
    pub event_id: String,
    pub event_type: String,
    pub outcome: Option<ReconcileOutcome>,
    pub error: Option<String>,
}

/// Webhook handler and reconciler
pub struct WebhookHandler {
    verifier: WebhookVerifier,
    store: Arc<dyn ReconcilerStore>,
    alerts: Arc<dyn AlertSink>,
    catalog: Arc<PlanCatalog>,
    claim_timeout: Duration,
    max_commit_attempts: u32,
}

impl WebhookHandler {
    pub fn new(
        verifier: WebhookVerifier,
        store: Arc<dyn ReconcilerStore>,
        alerts: Arc<dyn AlertSink>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            verifier,
            store,
            alerts,
            catalog,
            claim_timeout: Duration::from_secs(crate::config::DEFAULT_CLAIM_TIMEOUT_SECS),
            max_commit_attempts: crate::config::DEFAULT_MAX_COMMIT_ATTEMPTS,
        }
    }

    pub fn from_config(
        config: &BillingConfig,
        store: Arc<dyn ReconcilerStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self::new(
            WebhookVerifier::from_security(&config.webhook),
            store,
            alerts,
            Arc::new(config.catalog.clone()),
        )
        .with_claim_timeout(config.claim_timeout)
        .with_max_commit_attempts(config.max_commit_attempts)
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ReconcilerStore> {
        &self.store
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    /// Verify a raw provider delivery and reconcile it
    pub async fn ingest(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<ReconcileOutcome> {
        let verified = self.verifier.verify(payload, signature).inspect_err(|e| {
            tracing::warn!(error = %e, payload_len = payload.len(), "Rejected webhook delivery");
        })?;
        self.reconcile(&verified.envelope, verified.raw, EventSource::Provider)
            .await
    }

    /// Reconcile an authenticated envelope
    ///
    /// Transient errors leave the event Pending with its claim released, so
    /// a redelivery or the reprocessing job picks it up again. Any other
    /// error is dead-lettered and the event settles as Rejected.
    pub async fn reconcile(
        &self,
        envelope: &WebhookEnvelope,
        raw: serde_json::Value,
        source: EventSource,
    ) -> BillingResult<ReconcileOutcome> {
        let classification = classify(envelope, source);
        let new_event = NewWebhookEvent {
            event_id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            source,
            sequence: match source {
                EventSource::Provider => Some(envelope.created),
                EventSource::Internal => None,
            },
            payload: raw,
        };

        match self.store.claim(&new_event, self.claim_timeout).await? {
            ClaimOutcome::Fresh => {}
            ClaimOutcome::AlreadyClaimed => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "Webhook event currently being processed elsewhere"
                );
                return Ok(ReconcileOutcome::InFlight);
            }
            ClaimOutcome::AlreadyFinished(status) => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    status = %status,
                    "Duplicate webhook event"
                );
                return Ok(ReconcileOutcome::Duplicate { status });
            }
        }

        tracing::debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            source = source.as_str(),
            "Claimed webhook event"
        );

        match self.process(&envelope.id, classification).await {
            Ok(outcome) => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    outcome = outcome.label(),
                    "Webhook event reconciled"
                );
                Ok(outcome)
            }
            Err(e) if !e.is_transient() => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Webhook reconciliation failed permanently; dead-lettering"
                );
                match self
                    .reject(&envelope.id, None, format!("processing failed: {}", e))
                    .await
                {
                    Ok(outcome) => Ok(outcome),
                    Err(reject_err) => Err(self.release(&envelope.id, reject_err).await),
                }
            }
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Webhook reconciliation failed; event left pending"
                );
                Err(self.release(&envelope.id, e).await)
            }
        }
    }

    /// Give the claim back after `error`, which is handed back to the caller
    async fn release(&self, event_id: &str, error: BillingError) -> BillingError {
        if let Err(release_err) = self.store.release_claim(event_id, &error.to_string()).await {
            // The claim expires after claim_timeout regardless
            tracing::error!(
                event_id = %event_id,
                error = %release_err,
                "Failed to release webhook claim"
            );
        }
        error
    }

    async fn process(
        &self,
        event_id: &str,
        classification: Classification,
    ) -> BillingResult<ReconcileOutcome> {
        match classification {
            Classification::Unrecognized { event_type } => {
                tracing::info!(event_id = %event_id, event_type = %event_type, "Unhandled webhook event type");
                let reason = format!("unhandled event type {}", event_type);
                self.finish(event_id, &EventResolution::ignored(None, reason.clone()))
                    .await?;
                Ok(ReconcileOutcome::Ignored { reason })
            }
            Classification::NotApplicable { reason } => {
                self.finish(event_id, &EventResolution::ignored(None, reason.clone()))
                    .await?;
                Ok(ReconcileOutcome::Ignored { reason })
            }
            Classification::Malformed { reason } => self.reject(event_id, None, reason).await,
            Classification::Recognized(event) => self.apply(&event).await,
        }
    }

    async fn apply(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        let subscriber_id = match self.resolve_subscriber(event).await? {
            Ok(id) => id,
            Err(reason) => return self.reject(&event.event_id, None, reason).await,
        };

        for attempt in 1..=self.max_commit_attempts {
            let current = self.store.get_for_update(subscriber_id).await?;

            match transition(&current, event, &self.catalog) {
                Transition::Superseded { applied_version } => {
                    tracing::info!(
                        event_id = %event.event_id,
                        subscriber_id = %subscriber_id,
                        sequence = ?event.sequence,
                        applied_version,
                        "Stale webhook event superseded"
                    );
                    self.finish(
                        &event.event_id,
                        &EventResolution::superseded(subscriber_id, applied_version),
                    )
                    .await?;
                    return Ok(ReconcileOutcome::Superseded {
                        subscriber_id,
                        applied_version,
                    });
                }
                Transition::NoOp { reason } => {
                    tracing::info!(
                        event_id = %event.event_id,
                        subscriber_id = %subscriber_id,
                        reason = %reason,
                        "Webhook event does not apply"
                    );
                    self.finish(
                        &event.event_id,
                        &EventResolution::ignored(Some(subscriber_id), reason.clone()),
                    )
                    .await?;
                    return Ok(ReconcileOutcome::Ignored { reason });
                }
                Transition::Reject { reason } => {
                    return self
                        .reject(&event.event_id, Some(subscriber_id), reason)
                        .await;
                }
                Transition::Apply { next, effects } => {
                    let detail = describe_move(&current, &next);
                    match self
                        .store
                        .commit_transition(current.revision, &next, &event.event_id, Some(&detail))
                        .await?
                    {
                        CommitOutcome::Committed(committed) => {
                            tracing::info!(
                                event_id = %event.event_id,
                                subscriber_id = %subscriber_id,
                                transition = %detail,
                                revision = committed.revision,
                                "Subscriber transition committed"
                            );
                            self.dispatch_effects(&committed, &effects);
                            return Ok(ReconcileOutcome::Applied {
                                subscriber_id,
                                plan: committed.state.plan(),
                                status: committed.state.status(),
                                effects,
                            });
                        }
                        CommitOutcome::Conflict => {
                            tracing::debug!(
                                event_id = %event.event_id,
                                subscriber_id = %subscriber_id,
                                attempt,
                                "Subscriber changed concurrently; re-reading"
                            );
                        }
                        CommitOutcome::EventAlreadyFinished => {
                            let status = self
                                .store
                                .get_event(&event.event_id)
                                .await?
                                .map(|e| e.status)
                                .unwrap_or(EventStatus::Applied);
                            tracing::warn!(
                                event_id = %event.event_id,
                                status = %status,
                                "Webhook event finished by another worker first"
                            );
                            return Ok(ReconcileOutcome::Duplicate { status });
                        }
                    }
                }
            }
        }

        tracing::warn!(
            event_id = %event.event_id,
            subscriber_id = %subscriber_id,
            attempts = self.max_commit_attempts,
            "Gave up committing after repeated conflicts"
        );
        Err(BillingError::CommitContention {
            subscriber_id,
            attempts: self.max_commit_attempts,
        })
    }

    /// Find the subscriber an event refers to
    ///
    /// The outer error is a store failure; the inner one is a reason to
    /// dead-letter the event.
    async fn resolve_subscriber(&self, event: &BillingEvent) -> BillingResult<Result<Uuid, String>> {
        if let Some(hint) = event.subscriber_hint() {
            let Ok(id) = Uuid::parse_str(hint.trim()) else {
                return Ok(Err(format!("subscriber reference '{}' is not a valid id", hint)));
            };
            if self.store.get_subscriber(id).await?.is_none() {
                return Ok(Err(format!("unknown subscriber {}", id)));
            }
            if let Some(customer_ref) = event.customer_ref() {
                if let Some(owner) = self.store.find_by_customer_ref(customer_ref).await? {
                    if owner.id != id {
                        return Ok(Err(format!(
                            "customer {} belongs to subscriber {}, not {}",
                            customer_ref, owner.id, id
                        )));
                    }
                }
            }
            return Ok(Ok(id));
        }

        match event.customer_ref() {
            Some(customer_ref) => Ok(self
                .store
                .find_by_customer_ref(customer_ref)
                .await?
                .map(|s| s.id)
                .ok_or_else(|| format!("no subscriber for customer {}", customer_ref))),
            None => Ok(Err("event does not identify a subscriber".to_string())),
        }
    }

    async fn finish(&self, event_id: &str, resolution: &EventResolution) -> BillingResult<()> {
        if !self.store.finish_event(event_id, resolution).await? {
            tracing::warn!(
                event_id = %event_id,
                status = %resolution.status,
                "Webhook event was no longer pending when finishing"
            );
        }
        Ok(())
    }

    async fn reject(
        &self,
        event_id: &str,
        subscriber_id: Option<Uuid>,
        reason: String,
    ) -> BillingResult<ReconcileOutcome> {
        tracing::warn!(
            event_id = %event_id,
            subscriber_id = ?subscriber_id,
            reason = %reason,
            "Webhook event rejected for manual review"
        );
        self.finish(event_id, &EventResolution::rejected(subscriber_id, reason.clone()))
            .await?;

        let alert = OperatorAlert::rejected_event(event_id, subscriber_id, &reason);
        if let Err(e) = self.alerts.send(&alert).await {
            tracing::error!(event_id = %event_id, error = %e, "Failed to deliver operator alert");
        }
        Ok(ReconcileOutcome::Rejected { reason })
    }

    fn dispatch_effects(&self, subscriber: &Subscriber, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::PaymentFailed { attempt_count, .. } => tracing::warn!(
                    subscriber_id = %subscriber.id,
                    attempt_count,
                    "Subscription payment failed"
                ),
                other => tracing::info!(
                    subscriber_id = %subscriber.id,
                    effect = ?other,
                    "Subscription effect"
                ),
            }
        }
    }

    /// Create a Free subscriber for a newly registered user (idempotent)
    pub async fn register(&self, subscriber_id: Uuid) -> BillingResult<Subscriber> {
        let subscriber = self.store.create_subscriber(subscriber_id).await?;
        tracing::debug!(subscriber_id = %subscriber_id, "Subscriber registered");
        Ok(subscriber)
    }

    pub async fn entitlement(&self, subscriber_id: Uuid) -> BillingResult<Entitlement> {
        self.store
            .get_subscriber(subscriber_id)
            .await?
            .map(|s| Entitlement::from(&s))
            .ok_or(BillingError::SubscriberNotFound(subscriber_id))
    }

    pub async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.list_events(status, limit, offset).await
    }

    /// Rejected events awaiting operator review
    pub async fn dead_letters(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store
            .list_events(Some(EventStatus::Rejected), limit, 0)
            .await
    }

    /// Re-run Pending events nobody is working on, from their stored payload
    pub async fn reprocess_stale(&self, limit: i64) -> BillingResult<Vec<ReprocessResult>> {
        let stale = self
            .store
            .list_stale_pending(self.claim_timeout, limit)
            .await?;
        let mut results = Vec::with_capacity(stale.len());

        for record in stale {
            let outcome = match serde_json::from_value::<WebhookEnvelope>(record.payload.clone()) {
                // Verified at ingestion; the stored snapshot is trusted
                Ok(envelope) => {
                    self.reconcile(&envelope, record.payload.clone(), record.source)
                        .await
                }
                Err(e) => self.reject_unreadable(&record, e.to_string()).await,
            };

            let result = match outcome {
                Ok(outcome) => ReprocessResult {
                    event_id: record.event_id,
                    event_type: record.event_type,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(e) => ReprocessResult {
                    event_id: record.event_id,
                    event_type: record.event_type,
                    outcome: None,
                    error: Some(e.to_string()),
                },
            };
            results.push(result);
        }

        Ok(results)
    }

    async fn reject_unreadable(
        &self,
        record: &WebhookEventRecord,
        reason: String,
    ) -> BillingResult<ReconcileOutcome> {
        let new_event = NewWebhookEvent {
            event_id: record.event_id.clone(),
            event_type: record.event_type.clone(),
            source: record.source,
            sequence: record.sequence,
            payload: record.payload.clone(),
        };
        match self.store.claim(&new_event, self.claim_timeout).await? {
            ClaimOutcome::Fresh => {
                self.reject(
                    &record.event_id,
                    None,
                    format!("stored payload unreadable: {}", reason),
                )
                .await
            }
            ClaimOutcome::AlreadyClaimed => Ok(ReconcileOutcome::InFlight),
            ClaimOutcome::AlreadyFinished(status) => Ok(ReconcileOutcome::Duplicate { status }),
        }
    }
}

/// `true` for errors the endpoint reports as a bad request
pub fn is_client_error(error: &BillingError) -> bool {
    matches!(error, BillingError::Verification(_))
}

/// Verification failure kind, for logging at the HTTP edge
pub fn verification_error(error: &BillingError) -> Option<&VerificationError> {
    match error {
        BillingError::Verification(e) => Some(e),
        _ => None,
    }
}

fn describe_move(current: &Subscriber, next: &Subscriber) -> String {
    format!(
        "{}/{} -> {}/{}",
        current.state.status(),
        current.state.plan(),
        next.state.status(),
        next.state.plan()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertSink;
    use crate::signature::signature_header;
    use crate::store::MemoryStore;
    use crate::subscriptions::SubscriptionState;

    const SECRET: &str = "whsec_handler_test";

    fn handler(store: Arc<MemoryStore>) -> WebhookHandler {
        WebhookHandler::new(
            WebhookVerifier::signed(SECRET, Duration::from_secs(300)),
            store,
            Arc::new(LogAlertSink),
            Arc::new(PlanCatalog::new("price_pro", "price_premium")),
        )
    }

    fn checkout_body(event_id: &str, subscriber_id: Uuid, created: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": created,
            "data": {"object": {
                "mode": "subscription",
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": {"user_id": subscriber_id.to_string(), "plan": "Pro"}
            }}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_signed_checkout_is_applied() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone());
        let subscriber_id = Uuid::new_v4();
        handler.register(subscriber_id).await.unwrap();

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let body = checkout_body("evt_1", subscriber_id, now);
        let header = signature_header(SECRET, now, &body);
        let outcome = handler.ingest(&body, Some(&header)).await.unwrap();

        assert_eq!(outcome.label(), "applied");
        let subscriber = store.get_subscriber(subscriber_id).await.unwrap().unwrap();
        assert_eq!(subscriber.state, SubscriptionState::Active { plan: Plan::Pro });
    }

    #[tokio::test]
    async fn test_bad_signature_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone());
        let subscriber_id = Uuid::new_v4();
        handler.register(subscriber_id).await.unwrap();

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let body = checkout_body("evt_1", subscriber_id, now);
        let header = signature_header("whsec_wrong", now, &body);
        let err = handler.ingest(&body, Some(&header)).await.unwrap_err();

        assert!(is_client_error(&err));
        assert_eq!(
            verification_error(&err),
            Some(&VerificationError::SignatureMismatch)
        );
        assert_eq!(store.event_count().await, 0);
        let subscriber = store.get_subscriber(subscriber_id).await.unwrap().unwrap();
        assert_eq!(subscriber.state, SubscriptionState::Free);
    }

    #[tokio::test]
    async fn test_unknown_subscriber_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone());
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let body = checkout_body("evt_1", Uuid::new_v4(), now);
        let header = signature_header(SECRET, now, &body);

        let outcome = handler.ingest(&body, Some(&header)).await.unwrap();
        assert_eq!(outcome.label(), "rejected");
        let record = store.get_event("evt_1").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Rejected);
    }
}
