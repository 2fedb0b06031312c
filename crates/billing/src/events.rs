//! Event envelopes and classification
//!
//! Turns a verified provider envelope into one variant of the closed
//! [`BillingEventKind`] set. Types outside that set are reported as
//! unrecognized and acknowledged without touching subscriber state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Metadata key carrying the internal subscriber id on provider objects
pub const META_USER_ID: &str = "user_id";
/// Metadata key carrying the purchased plan on checkout sessions
pub const META_PLAN: &str = "plan";

const INTERNAL_EVENT_PREFIX: &str = "internal_";

/// `{id, type, created, data: {object}}` as delivered by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    pub object: serde_json::Value,
}

impl WebhookEnvelope {
    /// Envelope for a user-initiated downgrade routed through the reconciler
    pub fn downgrade_request(subscriber_id: Uuid, effective_at: OffsetDateTime) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Self {
            id: format!("{}downgrade_{}", INTERNAL_EVENT_PREFIX, Uuid::new_v4().simple()),
            event_type: EventType::DowngradeRequested.as_str().to_string(),
            created: now,
            data: EnvelopeData {
                object: serde_json::json!({
                    "subscriber_id": subscriber_id,
                    "effective_at": effective_at.unix_timestamp(),
                }),
            },
        }
    }
}

/// Where an envelope came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Pushed by the billing provider and signature-checked on ingestion
    Provider,
    /// Produced by this application (user-initiated actions)
    Internal,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Provider => "provider",
            EventSource::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provider" => Some(EventSource::Provider),
            "internal" => Some(EventSource::Internal),
            _ => None,
        }
    }
}

/// The closed set of event types the reconciler acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    CheckoutSessionCompleted,
    InvoicePaymentFailed,
    InvoicePaymentSucceeded,
    CustomerSubscriptionUpdated,
    CustomerSubscriptionDeleted,
    DowngradeRequested,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CheckoutSessionCompleted => "checkout.session.completed",
            EventType::InvoicePaymentFailed => "invoice.payment_failed",
            EventType::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            EventType::CustomerSubscriptionUpdated => "customer.subscription.updated",
            EventType::CustomerSubscriptionDeleted => "customer.subscription.deleted",
            EventType::DowngradeRequested => "internal.downgrade_requested",
        }
    }

    /// Internal types are only honoured from [`EventSource::Internal`], so a
    /// provider (or anyone reaching an unverified endpoint) cannot forge them.
    pub fn from_wire(event_type: &str, source: EventSource) -> Option<Self> {
        let parsed = match event_type {
            "checkout.session.completed" => EventType::CheckoutSessionCompleted,
            "invoice.payment_failed" => EventType::InvoicePaymentFailed,
            "invoice.payment_succeeded" => EventType::InvoicePaymentSucceeded,
            "customer.subscription.updated" => EventType::CustomerSubscriptionUpdated,
            "customer.subscription.deleted" => EventType::CustomerSubscriptionDeleted,
            "internal.downgrade_requested" => EventType::DowngradeRequested,
            _ => return None,
        };
        match (parsed, source) {
            (EventType::DowngradeRequested, EventSource::Provider) => None,
            (EventType::DowngradeRequested, EventSource::Internal) => Some(parsed),
            (_, EventSource::Provider) => Some(parsed),
            (_, EventSource::Internal) => None,
        }
    }
}

/// A provider id that may arrive either bare or expanded into an object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum ObjectRef {
    Id(String),
    Object { id: String },
}

impl ObjectRef {
    fn into_id(self) -> String {
        match self {
            ObjectRef::Id(id) | ObjectRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    mode: Option<String>,
    customer: Option<ObjectRef>,
    subscription: Option<ObjectRef>,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataHolder {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    customer: Option<ObjectRef>,
    subscription: Option<ObjectRef>,
    attempt_count: Option<u32>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    subscription_details: Option<MetadataHolder>,
}

#[derive(Debug, Deserialize)]
struct PriceObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItemObject {
    price: Option<PriceObject>,
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItemList {
    #[serde(default)]
    data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<ObjectRef>,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    current_period_end: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    items: Option<SubscriptionItemList>,
}

#[derive(Debug, Deserialize)]
struct DowngradeObject {
    subscriber_id: Uuid,
    effective_at: i64,
}

/// `checkout.session.completed` with `mode=subscription`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub subscriber_hint: Option<String>,
    pub plan: Option<String>,
}

/// `invoice.payment_failed` / `invoice.payment_succeeded`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceNotice {
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub subscriber_hint: Option<String>,
    /// Provider's count of collection attempts for this invoice
    pub attempt_count: Option<u32>,
}

/// `customer.subscription.updated` / `customer.subscription.deleted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub subscription_ref: String,
    pub customer_ref: Option<String>,
    pub subscriber_hint: Option<String>,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<i64>,
    pub price_ref: Option<String>,
    pub plan_hint: Option<String>,
}

/// User asked to move to Free at the end of the paid period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowngradeRequest {
    pub subscriber_id: Uuid,
    pub effective_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEventKind {
    CheckoutCompleted(CheckoutCompleted),
    InvoicePaymentFailed(InvoiceNotice),
    InvoicePaymentSucceeded(InvoiceNotice),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    DowngradeRequested(DowngradeRequest),
}

/// A recognized event with its ordering metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingEvent {
    pub event_id: String,
    /// Provider logical sequence; `None` for internal commands, which are
    /// not ordered against provider events.
    pub sequence: Option<i64>,
    pub kind: BillingEventKind,
}

impl BillingEvent {
    pub fn event_type(&self) -> EventType {
        match &self.kind {
            BillingEventKind::CheckoutCompleted(_) => EventType::CheckoutSessionCompleted,
            BillingEventKind::InvoicePaymentFailed(_) => EventType::InvoicePaymentFailed,
            BillingEventKind::InvoicePaymentSucceeded(_) => EventType::InvoicePaymentSucceeded,
            BillingEventKind::SubscriptionUpdated(_) => EventType::CustomerSubscriptionUpdated,
            BillingEventKind::SubscriptionDeleted(_) => EventType::CustomerSubscriptionDeleted,
            BillingEventKind::DowngradeRequested(_) => EventType::DowngradeRequested,
        }
    }

    /// Raw internal subscriber id carried by the event, if any
    pub fn subscriber_hint(&self) -> Option<String> {
        match &self.kind {
            BillingEventKind::CheckoutCompleted(c) => c.subscriber_hint.clone(),
            BillingEventKind::InvoicePaymentFailed(i)
            | BillingEventKind::InvoicePaymentSucceeded(i) => i.subscriber_hint.clone(),
            BillingEventKind::SubscriptionUpdated(s) | BillingEventKind::SubscriptionDeleted(s) => {
                s.subscriber_hint.clone()
            }
            BillingEventKind::DowngradeRequested(d) => Some(d.subscriber_id.to_string()),
        }
    }

    /// Billing customer the event refers to, if any
    pub fn customer_ref(&self) -> Option<&str> {
        match &self.kind {
            BillingEventKind::CheckoutCompleted(c) => c.customer_ref.as_deref(),
            BillingEventKind::InvoicePaymentFailed(i)
            | BillingEventKind::InvoicePaymentSucceeded(i) => i.customer_ref.as_deref(),
            BillingEventKind::SubscriptionUpdated(s) | BillingEventKind::SubscriptionDeleted(s) => {
                s.customer_ref.as_deref()
            }
            BillingEventKind::DowngradeRequested(_) => None,
        }
    }
}

/// Result of routing an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Recognized(BillingEvent),
    /// Type outside the closed set; acknowledged and marked Ignored
    Unrecognized { event_type: String },
    /// Recognized type that carries nothing for the reconciler
    NotApplicable { reason: String },
    /// Recognized type whose object cannot be read (dead-letter)
    Malformed { reason: String },
}

/// Route an envelope to its typed event
pub fn classify(envelope: &WebhookEnvelope, source: EventSource) -> Classification {
    let Some(event_type) = EventType::from_wire(&envelope.event_type, source) else {
        return Classification::Unrecognized {
            event_type: envelope.event_type.clone(),
        };
    };

    let sequence = match source {
        EventSource::Provider => Some(envelope.created),
        EventSource::Internal => None,
    };
    let object = &envelope.data.object;

    let kind = match event_type {
        EventType::CheckoutSessionCompleted => {
            let session: CheckoutSessionObject = match decode(object, "checkout session") {
                Ok(s) => s,
                Err(c) => return c,
            };
            let mode = session.mode.as_deref().unwrap_or("unknown");
            if mode != "subscription" {
                return Classification::NotApplicable {
                    reason: format!("checkout mode '{}' does not affect subscriptions", mode),
                };
            }
            let subscriber_hint = session
                .metadata
                .get(META_USER_ID)
                .cloned()
                .or(session.client_reference_id);
            BillingEventKind::CheckoutCompleted(CheckoutCompleted {
                customer_ref: session.customer.map(ObjectRef::into_id),
                subscription_ref: session.subscription.map(ObjectRef::into_id),
                subscriber_hint,
                plan: session.metadata.get(META_PLAN).cloned(),
            })
        }
        EventType::InvoicePaymentFailed | EventType::InvoicePaymentSucceeded => {
            let invoice: InvoiceObject = match decode(object, "invoice") {
                Ok(i) => i,
                Err(c) => return c,
            };
            let subscriber_hint = invoice.metadata.get(META_USER_ID).cloned().or_else(|| {
                invoice
                    .subscription_details
                    .as_ref()
                    .and_then(|d| d.metadata.get(META_USER_ID).cloned())
            });
            let notice = InvoiceNotice {
                customer_ref: invoice.customer.map(ObjectRef::into_id),
                subscription_ref: invoice.subscription.map(ObjectRef::into_id),
                subscriber_hint,
                attempt_count: invoice.attempt_count,
            };
            if event_type == EventType::InvoicePaymentFailed {
                BillingEventKind::InvoicePaymentFailed(notice)
            } else {
                BillingEventKind::InvoicePaymentSucceeded(notice)
            }
        }
        EventType::CustomerSubscriptionUpdated | EventType::CustomerSubscriptionDeleted => {
            let subscription: SubscriptionObject = match decode(object, "subscription") {
                Ok(s) => s,
                Err(c) => return c,
            };
            let first_item = subscription
                .items
                .as_ref()
                .and_then(|items| items.data.first());
            let snapshot = SubscriptionSnapshot {
                current_period_end: subscription
                    .current_period_end
                    .or_else(|| first_item.and_then(|i| i.current_period_end)),
                price_ref: first_item.and_then(|i| i.price.as_ref().map(|p| p.id.clone())),
                subscriber_hint: subscription.metadata.get(META_USER_ID).cloned(),
                plan_hint: subscription.metadata.get(META_PLAN).cloned(),
                subscription_ref: subscription.id,
                customer_ref: subscription.customer.map(ObjectRef::into_id),
                status: subscription.status,
                cancel_at_period_end: subscription.cancel_at_period_end,
            };
            if event_type == EventType::CustomerSubscriptionUpdated {
                BillingEventKind::SubscriptionUpdated(snapshot)
            } else {
                BillingEventKind::SubscriptionDeleted(snapshot)
            }
        }
        EventType::DowngradeRequested => {
            let request: DowngradeObject = match decode(object, "downgrade request") {
                Ok(r) => r,
                Err(c) => return c,
            };
            let Ok(effective_at) = OffsetDateTime::from_unix_timestamp(request.effective_at) else {
                return Classification::Malformed {
                    reason: format!("effective_at {} is out of range", request.effective_at),
                };
            };
            BillingEventKind::DowngradeRequested(DowngradeRequest {
                subscriber_id: request.subscriber_id,
                effective_at,
            })
        }
    };

    Classification::Recognized(BillingEvent {
        event_id: envelope.id.clone(),
        sequence,
        kind,
    })
}

fn decode<T: serde::de::DeserializeOwned>(
    object: &serde_json::Value,
    what: &str,
) -> Result<T, Classification> {
    T::deserialize(object).map_err(|e| Classification::Malformed {
        reason: format!("unreadable {} object: {}", what, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, created: i64, object: serde_json::Value) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_1".to_string(),
            event_type: event_type.to_string(),
            created,
            data: EnvelopeData { object },
        }
    }

    #[test]
    fn test_subscription_checkout_is_recognized() {
        let env = envelope(
            "checkout.session.completed",
            1,
            json!({
                "id": "cs_test",
                "mode": "subscription",
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": {"user_id": "u-1", "plan": "Pro"}
            }),
        );

        let Classification::Recognized(event) = classify(&env, EventSource::Provider) else {
            panic!("expected recognized event");
        };
        assert_eq!(event.sequence, Some(1));
        assert_eq!(event.customer_ref(), Some("cus_1"));
        assert_eq!(event.subscriber_hint().as_deref(), Some("u-1"));
        assert_eq!(
            event.kind,
            BillingEventKind::CheckoutCompleted(CheckoutCompleted {
                customer_ref: Some("cus_1".to_string()),
                subscription_ref: Some("sub_1".to_string()),
                subscriber_hint: Some("u-1".to_string()),
                plan: Some("Pro".to_string()),
            })
        );
    }

    #[test]
    fn test_client_reference_id_is_a_fallback_hint() {
        let env = envelope(
            "checkout.session.completed",
            1,
            json!({"mode": "subscription", "client_reference_id": "u-2", "metadata": {}}),
        );
        let Classification::Recognized(event) = classify(&env, EventSource::Provider) else {
            panic!("expected recognized event");
        };
        assert_eq!(event.subscriber_hint().as_deref(), Some("u-2"));
    }

    #[test]
    fn test_one_time_checkout_is_not_applicable() {
        let env = envelope(
            "checkout.session.completed",
            1,
            json!({
                "mode": "payment",
                "amount_total": 499,
                "metadata": {"user_id": "1", "resume_id": "1", "type": "resume_download"}
            }),
        );
        assert!(matches!(
            classify(&env, EventSource::Provider),
            Classification::NotApplicable { .. }
        ));
    }

    #[test]
    fn test_unknown_type_is_unrecognized() {
        let env = envelope("charge.refunded", 1, json!({}));
        assert_eq!(
            classify(&env, EventSource::Provider),
            Classification::Unrecognized {
                event_type: "charge.refunded".to_string()
            }
        );
    }

    #[test]
    fn test_provider_cannot_forge_internal_types() {
        let env = envelope(
            "internal.downgrade_requested",
            1,
            json!({"subscriber_id": Uuid::new_v4(), "effective_at": 1_700_000_000}),
        );
        assert!(matches!(
            classify(&env, EventSource::Provider),
            Classification::Unrecognized { .. }
        ));
        assert!(matches!(
            classify(&env, EventSource::Internal),
            Classification::Recognized(_)
        ));
    }

    #[test]
    fn test_subscription_snapshot_reads_items_and_expanded_customer() {
        let env = envelope(
            "customer.subscription.updated",
            50,
            json!({
                "id": "sub_9",
                "customer": {"id": "cus_9", "object": "customer"},
                "status": "active",
                "cancel_at_period_end": true,
                "metadata": {"user_id": "u-9"},
                "items": {"data": [{"price": {"id": "price_premium"}, "current_period_end": 1_800_000_000}]}
            }),
        );
        let Classification::Recognized(event) = classify(&env, EventSource::Provider) else {
            panic!("expected recognized event");
        };
        let BillingEventKind::SubscriptionUpdated(snapshot) = event.kind else {
            panic!("expected subscription update");
        };
        assert_eq!(snapshot.customer_ref.as_deref(), Some("cus_9"));
        assert_eq!(snapshot.price_ref.as_deref(), Some("price_premium"));
        assert_eq!(snapshot.current_period_end, Some(1_800_000_000));
        assert!(snapshot.cancel_at_period_end);
    }

    #[test]
    fn test_invoice_hint_from_subscription_details() {
        let env = envelope(
            "invoice.payment_failed",
            3,
            json!({
                "customer": "cus_1",
                "attempt_count": 2,
                "subscription_details": {"metadata": {"user_id": "u-3"}}
            }),
        );
        let Classification::Recognized(event) = classify(&env, EventSource::Provider) else {
            panic!("expected recognized event");
        };
        assert_eq!(event.subscriber_hint().as_deref(), Some("u-3"));
        let BillingEventKind::InvoicePaymentFailed(notice) = event.kind else {
            panic!("expected invoice failure");
        };
        assert_eq!(notice.attempt_count, Some(2));
    }

    #[test]
    fn test_unreadable_object_is_malformed() {
        let env = envelope("customer.subscription.deleted", 1, json!({"customer": "cus_1"}));
        assert!(matches!(
            classify(&env, EventSource::Provider),
            Classification::Malformed { .. }
        ));
    }

    #[test]
    fn test_internal_events_carry_no_sequence() {
        let subscriber_id = Uuid::new_v4();
        let effective_at = OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap();
        let env = WebhookEnvelope::downgrade_request(subscriber_id, effective_at);
        assert!(env.id.starts_with("internal_downgrade_"));

        let Classification::Recognized(event) = classify(&env, EventSource::Internal) else {
            panic!("expected recognized event");
        };
        assert_eq!(event.sequence, None);
        assert_eq!(
            event.kind,
            BillingEventKind::DowngradeRequested(DowngradeRequest {
                subscriber_id,
                effective_at
            })
        );
    }
}
