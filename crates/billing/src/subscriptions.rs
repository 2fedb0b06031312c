//! Subscription state machine
//!
//! [`transition`] is pure: it takes the subscriber as read from the store and
//! a classified event, and decides the next subscriber plus the effects to
//! dispatch once that state is committed. All I/O lives in the reconciler.

use std::str::FromStr;

use resumely_shared::Plan;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::PlanCatalog;
use crate::events::{
    BillingEvent, BillingEventKind, CheckoutCompleted, DowngradeRequest, InvoiceNotice,
    SubscriptionSnapshot,
};

/// Provider subscription status that keeps an update applicable
const PROVIDER_STATUS_ACTIVE: &str = "active";

/// Persisted status column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelling,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelling => "cancelling",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "cancelling" => Some(SubscriptionStatus::Cancelling),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Free,
    Active { plan: Plan },
    PastDue { plan: Plan, attempt_count: u32 },
    Cancelling { plan: Plan, effective_at: OffsetDateTime },
    Cancelled,
}

impl SubscriptionState {
    pub fn plan(&self) -> Plan {
        match self {
            SubscriptionState::Free | SubscriptionState::Cancelled => Plan::Free,
            SubscriptionState::Active { plan }
            | SubscriptionState::PastDue { plan, .. }
            | SubscriptionState::Cancelling { plan, .. } => *plan,
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        match self {
            SubscriptionState::Free | SubscriptionState::Active { .. } => SubscriptionStatus::Active,
            SubscriptionState::PastDue { .. } => SubscriptionStatus::PastDue,
            SubscriptionState::Cancelling { .. } => SubscriptionStatus::Cancelling,
            SubscriptionState::Cancelled => SubscriptionStatus::Cancelled,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        match self {
            SubscriptionState::PastDue { attempt_count, .. } => *attempt_count,
            _ => 0,
        }
    }

    pub fn effective_at(&self) -> Option<OffsetDateTime> {
        match self {
            SubscriptionState::Cancelling { effective_at, .. } => Some(*effective_at),
            _ => None,
        }
    }

    /// Cancelled is transient: it is always persisted as Free/Active
    pub fn normalized(self) -> Self {
        match self {
            SubscriptionState::Cancelled => SubscriptionState::Free,
            SubscriptionState::Active { plan: Plan::Free } => SubscriptionState::Free,
            other => other,
        }
    }

    /// Whether paid features are currently unlocked
    ///
    /// PastDue keeps access while the provider retries collection, and
    /// Cancelling keeps it until the end of the paid period.
    pub fn is_entitled(&self) -> bool {
        self.plan().is_paid()
    }

    /// Rebuild a state from its persisted columns
    pub fn from_parts(
        plan: Plan,
        status: SubscriptionStatus,
        attempt_count: u32,
        effective_at: Option<OffsetDateTime>,
    ) -> Option<Self> {
        let state = match (status, plan) {
            (SubscriptionStatus::Cancelled, _) => SubscriptionState::Cancelled,
            (SubscriptionStatus::Active, Plan::Free) => SubscriptionState::Free,
            (_, Plan::Free) => return None,
            (SubscriptionStatus::Active, plan) => SubscriptionState::Active { plan },
            (SubscriptionStatus::PastDue, plan) => SubscriptionState::PastDue {
                plan,
                attempt_count,
            },
            (SubscriptionStatus::Cancelling, plan) => SubscriptionState::Cancelling {
                plan,
                effective_at: effective_at?,
            },
        };
        Some(state.normalized())
    }
}

/// Reconciled subscriber as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub id: Uuid,
    pub state: SubscriptionState,
    pub billing_customer_ref: Option<String>,
    pub billing_subscription_ref: Option<String>,
    /// Sequence of the newest provider event applied to this subscriber
    pub applied_version: Option<i64>,
    /// Bumped by every commit; the optimistic-concurrency token
    pub revision: i64,
    pub updated_at: OffsetDateTime,
}

impl Subscriber {
    pub fn new_free(id: Uuid) -> Self {
        Self {
            id,
            state: SubscriptionState::Free,
            billing_customer_ref: None,
            billing_subscription_ref: None,
            applied_version: None,
            revision: 0,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// What the rest of the application may read about a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub subscriber_id: Uuid,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub entitled: bool,
    pub attempt_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_effective_at: Option<OffsetDateTime>,
}

impl From<&Subscriber> for Entitlement {
    fn from(subscriber: &Subscriber) -> Self {
        Self {
            subscriber_id: subscriber.id,
            plan: subscriber.state.plan(),
            status: subscriber.state.status(),
            entitled: subscriber.state.is_entitled(),
            attempt_count: subscriber.state.attempt_count(),
            cancel_effective_at: subscriber.state.effective_at(),
        }
    }
}

/// Side effects of a committed transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    PlanChanged { from: Plan, to: Plan },
    PaymentFailed { plan: Plan, attempt_count: u32 },
    PaymentRecovered { plan: Plan },
    CancellationScheduled {
        plan: Plan,
        #[serde(with = "time::serde::rfc3339")]
        effective_at: OffsetDateTime,
    },
    SubscriptionEnded { previous_plan: Plan },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Commit `next` and dispatch `effects` afterwards
    Apply { next: Subscriber, effects: Vec<Effect> },
    /// Event is not newer than what the subscriber already reflects
    Superseded { applied_version: i64 },
    /// Precondition not met; the subscriber is left untouched
    NoOp { reason: String },
    /// Event can never be applied and needs operator review
    Reject { reason: String },
}

/// Decide what `event` does to `current`
pub fn transition(current: &Subscriber, event: &BillingEvent, catalog: &PlanCatalog) -> Transition {
    if let (Some(sequence), Some(applied)) = (event.sequence, current.applied_version) {
        if sequence <= applied {
            return Transition::Superseded {
                applied_version: applied,
            };
        }
    }

    if let (Some(incoming), Some(known)) = (event.customer_ref(), current.billing_customer_ref.as_deref()) {
        if incoming != known {
            return Transition::Reject {
                reason: format!(
                    "event customer {} does not match subscriber customer {}",
                    incoming, known
                ),
            };
        }
    }

    let decision = match &event.kind {
        BillingEventKind::CheckoutCompleted(checkout) => on_checkout_completed(current, checkout),
        BillingEventKind::InvoicePaymentFailed(invoice) => on_payment_failed(current, invoice),
        BillingEventKind::InvoicePaymentSucceeded(invoice) => on_payment_succeeded(current, invoice),
        BillingEventKind::SubscriptionUpdated(snapshot) => {
            on_subscription_updated(current, snapshot, catalog)
        }
        BillingEventKind::SubscriptionDeleted(snapshot) => on_subscription_deleted(current, snapshot),
        BillingEventKind::DowngradeRequested(request) => on_downgrade_requested(current, request),
    };

    match decision {
        Decision::Move {
            state,
            customer_ref,
            subscription_ref,
            effects,
        } => {
            let mut next = current.clone();
            next.state = state.normalized();
            if next.billing_customer_ref.is_none() {
                next.billing_customer_ref = customer_ref;
            }
            match subscription_ref {
                RefUpdate::Keep => {}
                RefUpdate::Set(r) => next.billing_subscription_ref = Some(r),
                RefUpdate::Clear => next.billing_subscription_ref = None,
            }
            next.applied_version = event.sequence.or(current.applied_version);
            next.updated_at = OffsetDateTime::now_utc();
            Transition::Apply { next, effects }
        }
        Decision::NoOp(reason) => Transition::NoOp { reason },
        Decision::Reject(reason) => Transition::Reject { reason },
    }
}

enum RefUpdate {
    Keep,
    Set(String),
    Clear,
}

enum Decision {
    Move {
        state: SubscriptionState,
        customer_ref: Option<String>,
        subscription_ref: RefUpdate,
        effects: Vec<Effect>,
    },
    NoOp(String),
    Reject(String),
}

impl Decision {
    fn to(state: SubscriptionState, effects: Vec<Effect>) -> Self {
        Decision::Move {
            state,
            customer_ref: None,
            subscription_ref: RefUpdate::Keep,
            effects,
        }
    }

    fn with_refs(self, customer_ref: Option<&String>, subscription_ref: Option<&String>) -> Self {
        match self {
            Decision::Move { state, effects, .. } => Decision::Move {
                state,
                customer_ref: customer_ref.cloned(),
                subscription_ref: subscription_ref.cloned().map_or(RefUpdate::Keep, RefUpdate::Set),
                effects,
            },
            other => other,
        }
    }
}

fn plan_changed(from: Plan, to: Plan) -> Vec<Effect> {
    if from == to {
        Vec::new()
    } else {
        vec![Effect::PlanChanged { from, to }]
    }
}

/// Reason to ignore an event scoped to a subscription other than the tracked one
///
/// Only checkout replaces the tracked subscription.
fn foreign_subscription(current: &Subscriber, incoming: Option<&str>) -> Option<Decision> {
    match (current.billing_subscription_ref.as_deref(), incoming) {
        (Some(known), Some(incoming)) if known != incoming => Some(Decision::NoOp(format!(
            "subscription {} is not the current subscription {}",
            incoming, known
        ))),
        _ => None,
    }
}

fn on_checkout_completed(current: &Subscriber, checkout: &CheckoutCompleted) -> Decision {
    let Some(raw) = checkout.plan.as_deref() else {
        return Decision::Reject("checkout session carries no plan metadata".to_string());
    };
    let plan = match Plan::from_str(raw) {
        Ok(plan) if plan.is_paid() => plan,
        Ok(_) => return Decision::Reject(format!("checkout session for non-paid plan '{}'", raw)),
        Err(_) => return Decision::Reject(format!("unknown plan metadata '{}'", raw)),
    };

    Decision::to(
        SubscriptionState::Active { plan },
        plan_changed(current.state.plan(), plan),
    )
    .with_refs(checkout.customer_ref.as_ref(), checkout.subscription_ref.as_ref())
}

fn on_payment_failed(current: &Subscriber, invoice: &InvoiceNotice) -> Decision {
    if let Some(ignored) = foreign_subscription(current, invoice.subscription_ref.as_deref()) {
        return ignored;
    }
    let (plan, previous_attempts) = match current.state {
        SubscriptionState::Active { plan } => (plan, 0),
        SubscriptionState::PastDue { plan, attempt_count } => (plan, attempt_count),
        other => {
            return Decision::NoOp(format!(
                "payment failure does not apply to {} subscriber",
                other.status()
            ))
        }
    };
    let attempt_count = (previous_attempts + 1).max(invoice.attempt_count.unwrap_or(0));

    Decision::to(
        SubscriptionState::PastDue { plan, attempt_count },
        vec![Effect::PaymentFailed { plan, attempt_count }],
    )
}

fn on_payment_succeeded(current: &Subscriber, invoice: &InvoiceNotice) -> Decision {
    if let Some(ignored) = foreign_subscription(current, invoice.subscription_ref.as_deref()) {
        return ignored;
    }
    match current.state {
        SubscriptionState::PastDue { plan, .. } => Decision::to(
            SubscriptionState::Active { plan },
            vec![Effect::PaymentRecovered { plan }],
        ),
        // Renewal on a healthy subscription
        other => Decision::NoOp(format!(
            "payment success does not change a {} subscriber",
            other.status()
        )),
    }
}

fn on_subscription_updated(
    current: &Subscriber,
    snapshot: &SubscriptionSnapshot,
    catalog: &PlanCatalog,
) -> Decision {
    if let Some(ignored) = foreign_subscription(current, Some(&snapshot.subscription_ref)) {
        return ignored;
    }
    let current_plan = match current.state {
        SubscriptionState::Active { plan } | SubscriptionState::PastDue { plan, .. } => plan,
        other => {
            return Decision::NoOp(format!(
                "subscription update does not apply to {} subscriber",
                other.status()
            ))
        }
    };
    if snapshot.status != PROVIDER_STATUS_ACTIVE {
        return Decision::NoOp(format!(
            "provider subscription status is '{}'",
            snapshot.status
        ));
    }

    let plan = match (snapshot.price_ref.as_deref(), snapshot.plan_hint.as_deref()) {
        (Some(price), _) => match catalog.plan_for_price(price) {
            Some(plan) => plan,
            None => return Decision::Reject(format!("unknown price '{}'", price)),
        },
        (None, Some(raw)) => match Plan::from_str(raw) {
            Ok(plan) if plan.is_paid() => plan,
            _ => return Decision::Reject(format!("unknown plan metadata '{}'", raw)),
        },
        (None, None) => current_plan,
    };

    let decision = if snapshot.cancel_at_period_end {
        let Some(effective_at) = snapshot
            .current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        else {
            return Decision::Reject(
                "cancelling subscription update has no current_period_end".to_string(),
            );
        };
        let mut effects = plan_changed(current_plan, plan);
        effects.push(Effect::CancellationScheduled { plan, effective_at });
        Decision::to(SubscriptionState::Cancelling { plan, effective_at }, effects)
    } else {
        Decision::to(
            SubscriptionState::Active { plan },
            plan_changed(current_plan, plan),
        )
    };

    decision.with_refs(snapshot.customer_ref.as_ref(), Some(&snapshot.subscription_ref))
}

fn on_subscription_deleted(current: &Subscriber, snapshot: &SubscriptionSnapshot) -> Decision {
    if let Some(ignored) = foreign_subscription(current, Some(&snapshot.subscription_ref)) {
        return ignored;
    }

    let previous_plan = current.state.plan();
    let effects = if previous_plan.is_paid() {
        vec![Effect::SubscriptionEnded { previous_plan }]
    } else {
        Vec::new()
    };
    Decision::Move {
        state: SubscriptionState::Cancelled,
        customer_ref: snapshot.customer_ref.clone(),
        subscription_ref: RefUpdate::Clear,
        effects,
    }
}

fn on_downgrade_requested(current: &Subscriber, request: &DowngradeRequest) -> Decision {
    match current.state {
        SubscriptionState::Active { plan }
        | SubscriptionState::PastDue { plan, .. }
        | SubscriptionState::Cancelling { plan, .. } => Decision::to(
            SubscriptionState::Cancelling {
                plan,
                effective_at: request.effective_at,
            },
            vec![Effect::CancellationScheduled {
                plan,
                effective_at: request.effective_at,
            }],
        ),
        other => Decision::NoOp(format!(
            "downgrade does not apply to {} subscriber",
            other.status()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BillingEventKind, CheckoutCompleted};

    fn catalog() -> PlanCatalog {
        PlanCatalog::new("price_pro", "price_premium")
    }

    fn event(sequence: i64, kind: BillingEventKind) -> BillingEvent {
        BillingEvent {
            event_id: format!("evt_{}", sequence),
            sequence: Some(sequence),
            kind,
        }
    }

    fn checkout(plan: &str) -> BillingEventKind {
        BillingEventKind::CheckoutCompleted(CheckoutCompleted {
            customer_ref: Some("cus_1".to_string()),
            subscription_ref: Some("sub_1".to_string()),
            subscriber_hint: None,
            plan: Some(plan.to_string()),
        })
    }

    fn invoice(attempt_count: Option<u32>) -> InvoiceNotice {
        InvoiceNotice {
            customer_ref: Some("cus_1".to_string()),
            subscription_ref: Some("sub_1".to_string()),
            subscriber_hint: None,
            attempt_count,
        }
    }

    fn snapshot(status: &str, price: Option<&str>) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            subscription_ref: "sub_1".to_string(),
            customer_ref: Some("cus_1".to_string()),
            subscriber_hint: None,
            status: status.to_string(),
            cancel_at_period_end: false,
            current_period_end: Some(1_800_000_000),
            price_ref: price.map(str::to_string),
            plan_hint: None,
        }
    }

    fn apply(current: &Subscriber, event: &BillingEvent) -> (Subscriber, Vec<Effect>) {
        match transition(current, event, &catalog()) {
            Transition::Apply { next, effects } => (next, effects),
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    fn pro_subscriber() -> Subscriber {
        let (s, _) = apply(&Subscriber::new_free(Uuid::new_v4()), &event(1, checkout("Pro")));
        s
    }

    #[test]
    fn test_checkout_activates_and_records_refs() {
        let (next, effects) = apply(&Subscriber::new_free(Uuid::new_v4()), &event(1, checkout("Pro")));

        assert_eq!(next.state, SubscriptionState::Active { plan: Plan::Pro });
        assert_eq!(next.billing_customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(next.billing_subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(next.applied_version, Some(1));
        assert_eq!(
            effects,
            vec![Effect::PlanChanged {
                from: Plan::Free,
                to: Plan::Pro
            }]
        );
    }

    #[test]
    fn test_unknown_or_missing_plan_is_rejected() {
        let free = Subscriber::new_free(Uuid::new_v4());
        for plan in ["Enterprise", "free"] {
            assert!(matches!(
                transition(&free, &event(1, checkout(plan)), &catalog()),
                Transition::Reject { .. }
            ));
        }

        let no_plan = BillingEventKind::CheckoutCompleted(CheckoutCompleted {
            customer_ref: None,
            subscription_ref: None,
            subscriber_hint: None,
            plan: None,
        });
        assert!(matches!(
            transition(&free, &event(1, no_plan), &catalog()),
            Transition::Reject { .. }
        ));
    }

    #[test]
    fn test_older_or_equal_sequence_is_superseded() {
        let pro = pro_subscriber();
        let deleted = BillingEventKind::SubscriptionDeleted(snapshot("canceled", None));
        for seq in [0, 1] {
            assert_eq!(
                transition(&pro, &event(seq, deleted.clone()), &catalog()),
                Transition::Superseded { applied_version: 1 }
            );
        }
    }

    #[test]
    fn test_repeated_failures_count_attempts() {
        let pro = pro_subscriber();
        let (past_due, _) = apply(&pro, &event(2, BillingEventKind::InvoicePaymentFailed(invoice(None))));
        let (again, effects) = apply(
            &past_due,
            &event(3, BillingEventKind::InvoicePaymentFailed(invoice(None))),
        );

        assert_eq!(
            again.state,
            SubscriptionState::PastDue {
                plan: Plan::Pro,
                attempt_count: 2
            }
        );
        assert_eq!(
            effects,
            vec![Effect::PaymentFailed {
                plan: Plan::Pro,
                attempt_count: 2
            }]
        );
    }

    #[test]
    fn test_provider_attempt_count_wins_when_higher() {
        let (past_due, _) = apply(
            &pro_subscriber(),
            &event(2, BillingEventKind::InvoicePaymentFailed(invoice(Some(4)))),
        );
        assert_eq!(past_due.state.attempt_count(), 4);
    }

    #[test]
    fn test_payment_success_only_recovers_past_due() {
        let pro = pro_subscriber();
        assert!(matches!(
            transition(
                &pro,
                &event(2, BillingEventKind::InvoicePaymentSucceeded(invoice(None))),
                &catalog()
            ),
            Transition::NoOp { .. }
        ));

        let (past_due, _) = apply(&pro, &event(2, BillingEventKind::InvoicePaymentFailed(invoice(None))));
        let (recovered, effects) = apply(
            &past_due,
            &event(3, BillingEventKind::InvoicePaymentSucceeded(invoice(None))),
        );
        assert_eq!(recovered.state, SubscriptionState::Active { plan: Plan::Pro });
        assert_eq!(effects, vec![Effect::PaymentRecovered { plan: Plan::Pro }]);
    }

    #[test]
    fn test_failure_on_free_subscriber_is_noop() {
        let free = Subscriber::new_free(Uuid::new_v4());
        assert!(matches!(
            transition(
                &free,
                &event(1, BillingEventKind::InvoicePaymentFailed(invoice(None))),
                &catalog()
            ),
            Transition::NoOp { .. }
        ));
    }

    #[test]
    fn test_update_changes_plan_from_price() {
        let (next, effects) = apply(
            &pro_subscriber(),
            &event(
                5,
                BillingEventKind::SubscriptionUpdated(snapshot("active", Some("price_premium"))),
            ),
        );
        assert_eq!(next.state, SubscriptionState::Active { plan: Plan::Premium });
        assert_eq!(
            effects,
            vec![Effect::PlanChanged {
                from: Plan::Pro,
                to: Plan::Premium
            }]
        );
    }

    #[test]
    fn test_update_with_unknown_price_is_rejected() {
        assert!(matches!(
            transition(
                &pro_subscriber(),
                &event(5, BillingEventKind::SubscriptionUpdated(snapshot("active", Some("price_x")))),
                &catalog()
            ),
            Transition::Reject { .. }
        ));
    }

    #[test]
    fn test_non_active_update_is_noop() {
        assert!(matches!(
            transition(
                &pro_subscriber(),
                &event(5, BillingEventKind::SubscriptionUpdated(snapshot("past_due", None))),
                &catalog()
            ),
            Transition::NoOp { .. }
        ));
    }

    #[test]
    fn test_cancel_at_period_end_schedules_cancellation() {
        let mut snap = snapshot("active", Some("price_pro"));
        snap.cancel_at_period_end = true;
        let (next, effects) = apply(
            &pro_subscriber(),
            &event(5, BillingEventKind::SubscriptionUpdated(snap)),
        );

        let effective_at = OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap();
        assert_eq!(
            next.state,
            SubscriptionState::Cancelling {
                plan: Plan::Pro,
                effective_at
            }
        );
        assert!(next.state.is_entitled());
        assert_eq!(
            effects,
            vec![Effect::CancellationScheduled {
                plan: Plan::Pro,
                effective_at
            }]
        );
    }

    #[test]
    fn test_deletion_normalizes_to_free_and_keeps_customer() {
        let (next, effects) = apply(
            &pro_subscriber(),
            &event(6, BillingEventKind::SubscriptionDeleted(snapshot("canceled", None))),
        );
        assert_eq!(next.state, SubscriptionState::Free);
        assert_eq!(next.billing_customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(next.billing_subscription_ref, None);
        assert_eq!(
            effects,
            vec![Effect::SubscriptionEnded {
                previous_plan: Plan::Pro
            }]
        );
    }

    #[test]
    fn test_deletion_of_replaced_subscription_is_noop() {
        let mut snap = snapshot("canceled", None);
        snap.subscription_ref = "sub_old".to_string();
        assert!(matches!(
            transition(
                &pro_subscriber(),
                &event(6, BillingEventKind::SubscriptionDeleted(snap)),
                &catalog()
            ),
            Transition::NoOp { .. }
        ));
    }

    #[test]
    fn test_events_for_other_subscription_are_noop() {
        let pro = pro_subscriber();
        let (past_due, _) = apply(&pro, &event(2, BillingEventKind::InvoicePaymentFailed(invoice(None))));

        let mut foreign = invoice(None);
        foreign.subscription_ref = Some("sub_old".to_string());
        let mut updated = snapshot("active", Some("price_pro"));
        updated.subscription_ref = "sub_old".to_string();
        updated.cancel_at_period_end = true;

        let cases = [
            (&pro, BillingEventKind::InvoicePaymentFailed(foreign.clone())),
            (&past_due, BillingEventKind::InvoicePaymentSucceeded(foreign)),
            (&pro, BillingEventKind::SubscriptionUpdated(updated)),
        ];
        for (current, kind) in cases {
            assert!(matches!(
                transition(current, &event(5, kind), &catalog()),
                Transition::NoOp { .. }
            ));
        }
    }

    #[test]
    fn test_second_checkout_replaces_tracked_subscription() {
        let second = BillingEventKind::CheckoutCompleted(CheckoutCompleted {
            customer_ref: Some("cus_1".to_string()),
            subscription_ref: Some("sub_2".to_string()),
            subscriber_hint: None,
            plan: Some("Pro".to_string()),
        });
        let (next, _) = apply(&pro_subscriber(), &event(2, second));
        assert_eq!(next.billing_subscription_ref.as_deref(), Some("sub_2"));
    }

    #[test]
    fn test_foreign_customer_is_rejected() {
        let mut snap = snapshot("active", None);
        snap.customer_ref = Some("cus_other".to_string());
        assert!(matches!(
            transition(
                &pro_subscriber(),
                &event(6, BillingEventKind::SubscriptionUpdated(snap)),
                &catalog()
            ),
            Transition::Reject { .. }
        ));
    }

    #[test]
    fn test_downgrade_keeps_version_and_plan() {
        let pro = pro_subscriber();
        let effective_at = OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap();
        let request = BillingEvent {
            event_id: "internal_downgrade_1".to_string(),
            sequence: None,
            kind: BillingEventKind::DowngradeRequested(DowngradeRequest {
                subscriber_id: pro.id,
                effective_at,
            }),
        };

        let (next, _) = apply(&pro, &request);
        assert_eq!(
            next.state,
            SubscriptionState::Cancelling {
                plan: Plan::Pro,
                effective_at
            }
        );
        assert_eq!(next.applied_version, pro.applied_version);

        let free = Subscriber::new_free(Uuid::new_v4());
        assert!(matches!(
            transition(&free, &request, &catalog()),
            Transition::NoOp { .. }
        ));
    }

    #[test]
    fn test_state_round_trips_through_columns() {
        let effective_at = OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap();
        let states = [
            SubscriptionState::Free,
            SubscriptionState::Active { plan: Plan::Premium },
            SubscriptionState::PastDue {
                plan: Plan::Pro,
                attempt_count: 3,
            },
            SubscriptionState::Cancelling {
                plan: Plan::Pro,
                effective_at,
            },
        ];
        for state in states {
            let rebuilt = SubscriptionState::from_parts(
                state.plan(),
                state.status(),
                state.attempt_count(),
                state.effective_at(),
            );
            assert_eq!(rebuilt, Some(state));
        }
        assert_eq!(
            SubscriptionState::from_parts(Plan::Free, SubscriptionStatus::PastDue, 1, None),
            None
        );
    }
}
