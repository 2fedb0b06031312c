// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Resumely Billing Module
//!
//! Reconciles subscriber plan state from Stripe webhooks.
//!
//! ## Features
//!
//! - **Verification**: HMAC-SHA256 webhook signatures with a freshness window
//! - **Idempotency**: atomic per-event claim in the event store
//! - **Ordering**: stale events are recorded as superseded, never applied
//! - **State machine**: Free / Active / PastDue / Cancelling / Cancelled
//! - **Dead-letter**: events that can never apply are Rejected and alerted
//! - **Gateway**: checkout, customer portal and cancel-at-period-end calls

pub mod alerts;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod webhooks;


use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

// Alerts
pub use alerts::{AlertError, AlertSeverity, AlertSink, LogAlertSink, OperatorAlert, SlackAlertSink};

// Config
pub use config::{BillingConfig, PlanCatalog, PlanPrice, RedirectUrls, WebhookSecurity};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    classify, BillingEvent, BillingEventKind, Classification, EventSource, EventType,
    WebhookEnvelope,
};

// Gateway
pub use gateway::{BillingGateway, CheckoutRequest, GatewayError, RetryPolicy, StripeGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Signature
pub use signature::{
    sign_payload, signature_header, Verification, VerificationError, VerifiedEnvelope,
    WebhookVerifier, SIGNATURE_HEADER,
};

// Store
pub use store::{
    ClaimOutcome, CommitOutcome, EventResolution, EventStatus, EventStore, MemoryStore,
    NewWebhookEvent, PgStore, ReconcilerStore, SubscriberStore, WebhookEventRecord,
};

// Subscriptions
pub use subscriptions::{
    transition, Effect, Entitlement, Subscriber, SubscriptionState, SubscriptionStatus,
    Transition,
};

// Webhooks
pub use webhooks::{ReconcileOutcome, ReprocessResult, WebhookHandler};

pub use resumely_shared::Plan;

/// Confirmation returned for a user-initiated downgrade
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DowngradeReceipt {
    pub subscriber_id: Uuid,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    /// The downgrade had already been requested earlier
    pub already_scheduled: bool,
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub webhooks: WebhookHandler,
    gateway: Arc<dyn BillingGateway>,
    urls: RedirectUrls,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Ok(Self::from_config(&config, pool))
    }

    /// Postgres store, Stripe gateway, and Slack alerts when configured
    pub fn from_config(config: &BillingConfig, pool: PgPool) -> Self {
        let store: Arc<dyn ReconcilerStore> = Arc::new(PgStore::new(pool));
        let gateway: Arc<dyn BillingGateway> =
            Arc::new(StripeGateway::new(&config.stripe_secret_key));
        let alerts = alerts::sink_from_config(config.slack_webhook_url.as_deref());

        if !WebhookVerifier::from_security(&config.webhook).is_verified() {
            tracing::warn!("Webhook signature verification is DISABLED; never run this in production");
        }
        Self::new(config, store, gateway, alerts)
    }

    pub fn new(
        config: &BillingConfig,
        store: Arc<dyn ReconcilerStore>,
        gateway: Arc<dyn BillingGateway>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            webhooks: WebhookHandler::from_config(config, store, alerts),
            gateway,
            urls: config.urls.clone(),
        }
    }

    /// Start a hosted checkout for a paid plan
    ///
    /// The subscriber stays on its current plan until the checkout webhook
    /// is reconciled.
    pub async fn create_checkout_session(
        &self,
        subscriber_id: Uuid,
        plan: Plan,
    ) -> BillingResult<String> {
        let subscriber = self
            .webhooks
            .store()
            .get_subscriber(subscriber_id)
            .await?
            .ok_or(BillingError::SubscriberNotFound(subscriber_id))?;

        let price = self
            .webhooks
            .catalog()
            .price_for(plan)
            .ok_or(GatewayError::PlanNotPurchasable(plan))?;

        if subscriber.state.plan().is_paid() {
            return Err(BillingError::InvalidState(format!(
                "subscriber already has the {} plan; use the customer portal to change it",
                subscriber.state.plan()
            )));
        }

        let request = CheckoutRequest {
            subscriber_id,
            plan,
            price_id: price.price_id.clone(),
            customer_ref: subscriber.billing_customer_ref,
            success_url: self.urls.checkout_success.clone(),
            cancel_url: self.urls.checkout_cancel.clone(),
        };
        Ok(self.gateway.create_checkout_session(&request).await?)
    }

    /// Open the hosted customer portal
    pub async fn create_portal_session(&self, subscriber_id: Uuid) -> BillingResult<String> {
        let subscriber = self
            .webhooks
            .store()
            .get_subscriber(subscriber_id)
            .await?
            .ok_or(BillingError::SubscriberNotFound(subscriber_id))?;
        let customer_ref = subscriber
            .billing_customer_ref
            .ok_or(GatewayError::NoBillingCustomer(subscriber_id))?;

        Ok(self
            .gateway
            .create_portal_session(&customer_ref, &self.urls.portal_return)
            .await?)
    }

    /// Schedule a move to Free at the end of the paid period
    ///
    /// The provider is told first, with no subscriber state held. The
    /// subscriber then moves to Cancelling through the reconciler, and to
    /// Free only when the provider's deletion event arrives.
    pub async fn request_downgrade(&self, subscriber_id: Uuid) -> BillingResult<DowngradeReceipt> {
        let subscriber = self
            .webhooks
            .store()
            .get_subscriber(subscriber_id)
            .await?
            .ok_or(BillingError::SubscriberNotFound(subscriber_id))?;

        match subscriber.state {
            SubscriptionState::Free | SubscriptionState::Cancelled => {
                return Err(BillingError::InvalidState(
                    "subscriber is already on the free plan".to_string(),
                ))
            }
            SubscriptionState::Cancelling { effective_at, .. } => {
                return Ok(DowngradeReceipt {
                    subscriber_id,
                    status: SubscriptionStatus::Cancelling,
                    effective_at,
                    already_scheduled: true,
                })
            }
            SubscriptionState::Active { .. } | SubscriptionState::PastDue { .. } => {}
        }

        let subscription_ref = subscriber.billing_subscription_ref.ok_or_else(|| {
            BillingError::InvalidState("subscriber has no active provider subscription".to_string())
        })?;
        let effective_at = self.gateway.cancel_at_period_end(&subscription_ref).await?;

        let envelope = WebhookEnvelope::downgrade_request(subscriber_id, effective_at);
        let raw = serde_json::to_value(&envelope)
            .map_err(|e| BillingError::Internal(format!("failed to encode downgrade: {}", e)))?;

        match self
            .webhooks
            .reconcile(&envelope, raw, EventSource::Internal)
            .await?
        {
            ReconcileOutcome::Applied { status, .. } => {
                tracing::info!(
                    subscriber_id = %subscriber_id,
                    effective_at = %effective_at,
                    "Downgrade scheduled"
                );
                Ok(DowngradeReceipt {
                    subscriber_id,
                    status,
                    effective_at,
                    already_scheduled: false,
                })
            }
            ReconcileOutcome::Ignored { reason } | ReconcileOutcome::Rejected { reason } => {
                Err(BillingError::InvalidState(reason))
            }
            other => Err(BillingError::Internal(format!(
                "unexpected downgrade outcome: {}",
                other.label()
            ))),
        }
    }
}
