//! Billing Invariants Module
//!
//! Read-only consistency checks over reconciled state and the event ledger.
//! The worker runs them hourly and forwards violations to the operator
//! alert channel.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::{AlertSeverity, OperatorAlert};
use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub subscriber_ids: Vec<Uuid>,
    pub event_ids: Vec<String>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

impl InvariantViolation {
    pub fn to_alert(&self) -> OperatorAlert {
        OperatorAlert {
            severity: match self.severity {
                ViolationSeverity::Critical | ViolationSeverity::High => AlertSeverity::Critical,
                ViolationSeverity::Medium | ViolationSeverity::Low => AlertSeverity::Warning,
            },
            title: format!("Billing invariant violated: {}", self.invariant),
            detail: self.description.clone(),
            event_id: self.event_ids.first().cloned(),
            subscriber_id: self.subscriber_ids.first().copied(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Subscriber has access they did not pay for, or the reverse
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutCustomerRow {
    id: Uuid,
    plan: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OverdueCancellationRow {
    id: Uuid,
    plan: String,
    cancel_effective_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    event_id: String,
    event_type: String,
    attempts: i32,
    last_error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct RejectedEventRow {
    event_id: String,
    subscriber_id: Option<Uuid>,
    detail: Option<String>,
}

const CHECKS: [&str; 4] = [
    "paid_plan_has_customer",
    "cancellation_confirmed",
    "no_stuck_pending_events",
    "no_rejected_events",
];

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        violations.extend(self.check_paid_plan_has_customer().await?);
        violations.extend(self.check_cancellation_confirmed().await?);
        violations.extend(self.check_no_stuck_pending_events().await?);
        violations.extend(self.check_no_rejected_events().await?);
        Ok(InvariantCheckSummary::from_violations(CHECKS.len(), violations))
    }

    /// A paid plan can only come from a checkout, which always names a customer
    async fn check_paid_plan_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutCustomerRow> = sqlx::query_as(
            r#"
            SELECT id, plan
            FROM subscribers
            WHERE plan <> 'free' AND billing_customer_ref IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_plan_has_customer".to_string(),
                subscriber_ids: vec![row.id],
                event_ids: vec![],
                description: format!(
                    "Subscriber is on the {} plan but has no billing customer",
                    row.plan
                ),
                context: serde_json::json!({ "plan": row.plan }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Cancelling subscribers should be confirmed by a deletion event soon
    /// after their effective date
    async fn check_cancellation_confirmed(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverdueCancellationRow> = sqlx::query_as(
            r#"
            SELECT id, plan, cancel_effective_at
            FROM subscribers
            WHERE status = 'cancelling'
              AND cancel_effective_at < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancellation_confirmed".to_string(),
                subscriber_ids: vec![row.id],
                event_ids: vec![],
                description: format!(
                    "Subscriber still cancelling {} more than a day after {}",
                    row.plan, row.cancel_effective_at
                ),
                context: serde_json::json!({
                    "plan": row.plan,
                    "cancel_effective_at": row.cancel_effective_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_no_stuck_pending_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, attempts, last_error
            FROM webhook_events
            WHERE status = 'pending' AND received_at < NOW() - INTERVAL '1 hour'
            ORDER BY received_at ASC
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_pending_events".to_string(),
                subscriber_ids: vec![],
                description: format!(
                    "{} event pending for over an hour after {} attempts",
                    row.event_type, row.attempts
                ),
                context: serde_json::json!({
                    "attempts": row.attempts,
                    "last_error": row.last_error,
                }),
                event_ids: vec![row.event_id],
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Dead-lettered events in the last day, reported as one violation
    async fn check_no_rejected_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RejectedEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, subscriber_id, detail
            FROM webhook_events
            WHERE status = 'rejected' AND processed_at > NOW() - INTERVAL '1 day'
            ORDER BY processed_at DESC
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rejected_digest(rows).into_iter().collect())
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "paid_plan_has_customer" => self.check_paid_plan_has_customer().await,
            "cancellation_confirmed" => self.check_cancellation_confirmed().await,
            "no_stuck_pending_events" => self.check_no_stuck_pending_events().await,
            "no_rejected_events" => self.check_no_rejected_events().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}

fn rejected_digest(rows: Vec<RejectedEventRow>) -> Option<InvariantViolation> {
    if rows.is_empty() {
        return None;
    }
    let reasons: Vec<String> = rows
        .iter()
        .take(5)
        .map(|r| {
            format!(
                "{}: {}",
                r.event_id,
                r.detail.as_deref().unwrap_or("no detail")
            )
        })
        .collect();

    Some(InvariantViolation {
        invariant: "no_rejected_events".to_string(),
        subscriber_ids: rows.iter().filter_map(|r| r.subscriber_id).collect(),
        description: format!(
            "{} webhook event(s) rejected in the last day awaiting review",
            rows.len()
        ),
        context: serde_json::json!({ "examples": reasons }),
        event_ids: rows.into_iter().map(|r| r.event_id).collect(),
        severity: ViolationSeverity::Medium,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            subscriber_ids: vec![Uuid::nil()],
            event_ids: vec![],
            description: "test".to_string(),
            context: serde_json::json!({}),
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"paid_plan_has_customer"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            4,
            vec![
                violation("paid_plan_has_customer", ViolationSeverity::Critical),
                violation("paid_plan_has_customer", ViolationSeverity::Critical),
                violation("no_rejected_events", ViolationSeverity::Medium),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 2);
        assert!(!summary.healthy);

        assert!(InvariantCheckSummary::from_violations(4, vec![]).healthy);
    }

    #[test]
    fn test_severity_maps_to_alert_level() {
        let alert = violation("cancellation_confirmed", ViolationSeverity::High).to_alert();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.subscriber_id, Some(Uuid::nil()));
    }

    #[test]
    fn test_rejected_digest_aggregates_rows() {
        assert!(rejected_digest(vec![]).is_none());

        let subscriber = Uuid::new_v4();
        let digest = rejected_digest(vec![
            RejectedEventRow {
                event_id: "evt_1".to_string(),
                subscriber_id: Some(subscriber),
                detail: Some("unknown plan metadata 'Gold'".to_string()),
            },
            RejectedEventRow {
                event_id: "evt_2".to_string(),
                subscriber_id: None,
                detail: None,
            },
        ])
        .unwrap();

        assert_eq!(digest.event_ids, vec!["evt_1", "evt_2"]);
        assert_eq!(digest.subscriber_ids, vec![subscriber]);
        assert!(digest.description.starts_with("2 webhook event(s)"));
    }
}
