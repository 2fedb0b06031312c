//! Billing provider gateway
//!
//! Thin outbound calls to Stripe. Nothing here writes subscriber state: the
//! provider-side change only lands once its webhook is reconciled.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use resumely_shared::Plan;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::events::{META_PLAN, META_USER_ID};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Billing provider temporarily unavailable: {0}")]
    Transient(String),

    #[error("Billing provider rejected the request: {0}")]
    Permanent(String),

    #[error("Subscriber {0} has no billing customer yet")]
    NoBillingCustomer(Uuid),

    #[error("Plan {0} cannot be purchased")]
    PlanNotPurchasable(Plan),

    #[error("Provider response missing {0}")]
    IncompleteResponse(&'static str),
}

impl GatewayError {
    /// Worth retrying (rate limits, provider 5xx, timeouts, network)
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Everything needed to open a subscription checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub subscriber_id: Uuid,
    pub plan: Plan,
    pub price_id: String,
    pub customer_ref: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Returns the hosted checkout URL
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<String, GatewayError>;

    /// Returns the hosted customer portal URL
    async fn create_portal_session(
        &self,
        customer_ref: &str,
        return_url: &str,
    ) -> Result<String, GatewayError>;

    /// Ask the provider to end the subscription at period end; returns that date
    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<OffsetDateTime, GatewayError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Stripe-backed gateway
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
    retry: RetryPolicy,
}

impl StripeGateway {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut action: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, stripe::StripeError>>,
    {
        // 2^n * (initial/2): initial, 2*initial, 4*initial... capped
        let factor = u64::try_from(self.retry.initial_delay.as_millis() / 2).unwrap_or(100);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor.max(1))
            .max_delay(self.retry.max_delay)
            .map(jitter)
            .take(self.retry.max_retries);

        RetryIf::spawn(
            strategy,
            || {
                let fut = action();
                async move { fut.await.map_err(map_stripe_error) }
            },
            |e: &GatewayError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(operation, error = %e, "Retrying Stripe call after transient error");
                }
                retry
            },
        )
        .await
        .inspect_err(|e| tracing::error!(operation, error = %e, "Stripe call failed"))
    }
}

fn map_stripe_error(error: stripe::StripeError) -> GatewayError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| format!("HTTP {}", status));
            if status == 429 || (500..600).contains(&status) {
                GatewayError::Transient(message)
            } else {
                GatewayError::Permanent(message)
            }
        }
        stripe::StripeError::Timeout => GatewayError::Transient("request timed out".to_string()),
        stripe::StripeError::ClientError(msg) => GatewayError::Transient(msg),
        other => GatewayError::Permanent(other.to_string()),
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, GatewayError> {
    raw.parse::<T>()
        .map_err(|_| GatewayError::Permanent(format!("invalid {} id '{}'", what, raw)))
}

#[async_trait]
impl BillingGateway for StripeGateway {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<String, GatewayError> {
        if !request.plan.is_paid() {
            return Err(GatewayError::PlanNotPurchasable(request.plan));
        }
        let customer: Option<stripe::CustomerId> = request
            .customer_ref
            .as_deref()
            .map(|c| parse_id(c, "customer"))
            .transpose()?;

        let subscriber_id = request.subscriber_id.to_string();
        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), subscriber_id.clone());
        metadata.insert(META_PLAN.to_string(), request.plan.as_str().to_string());

        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.customer = customer;
        params.client_reference_id = Some(&subscriber_id);
        params.metadata = Some(metadata.clone());
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        // Later subscription/invoice events carry the same hints
        params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            ..Default::default()
        });

        let session = self
            .call("create_checkout_session", || {
                stripe::CheckoutSession::create(&self.client, params.clone())
            })
            .await?;

        tracing::info!(
            subscriber_id = %request.subscriber_id,
            plan = %request.plan,
            session_id = %session.id,
            "Created checkout session"
        );
        session.url.ok_or(GatewayError::IncompleteResponse("checkout url"))
    }

    async fn create_portal_session(
        &self,
        customer_ref: &str,
        return_url: &str,
    ) -> Result<String, GatewayError> {
        let customer: stripe::CustomerId = parse_id(customer_ref, "customer")?;
        let mut params = stripe::CreateBillingPortalSession::new(customer);
        params.return_url = Some(return_url);

        let session = self
            .call("create_portal_session", || {
                stripe::BillingPortalSession::create(&self.client, params.clone())
            })
            .await?;
        Ok(session.url)
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<OffsetDateTime, GatewayError> {
        let subscription_id: stripe::SubscriptionId = parse_id(subscription_ref, "subscription")?;
        let mut params = stripe::UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        let subscription = self
            .call("cancel_at_period_end", || {
                stripe::Subscription::update(&self.client, &subscription_id, params.clone())
            })
            .await?;

        OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
            .map_err(|_| GatewayError::IncompleteResponse("current_period_end"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(GatewayError::Transient("503".to_string()).is_transient());
        assert!(!GatewayError::Permanent("card declined".to_string()).is_transient());
        assert!(!GatewayError::NoBillingCustomer(Uuid::nil()).is_transient());
    }

    #[test]
    fn test_timeouts_map_to_transient() {
        assert!(map_stripe_error(stripe::StripeError::Timeout).is_transient());
        assert!(!map_stripe_error(stripe::StripeError::UnsupportedVersion).is_transient());
    }

    #[tokio::test]
    async fn test_free_plan_is_not_purchasable() {
        let gateway = StripeGateway::new("sk_test_unused");
        let request = CheckoutRequest {
            subscriber_id: Uuid::new_v4(),
            plan: Plan::Free,
            price_id: "price_free".to_string(),
            customer_ref: None,
            success_url: "http://localhost/ok".to_string(),
            cancel_url: "http://localhost/cancel".to_string(),
        };
        assert_eq!(
            gateway.create_checkout_session(&request).await.unwrap_err(),
            GatewayError::PlanNotPurchasable(Plan::Free)
        );
    }
}
