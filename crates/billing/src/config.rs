//! Billing configuration
//!
//! Everything here is read once at startup and never mutated afterwards.
//! Services receive the pieces they need (usually behind an `Arc`).

use std::time::Duration;

use resumely_shared::Plan;

use crate::error::{BillingError, BillingResult};

/// Default signature freshness window (Stripe's recommended tolerance)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// A Pending event whose claim is older than this may be re-claimed
pub const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 30 * 60;

/// Optimistic-commit attempts before answering the provider with a 5xx
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 5;

/// List price of a paid plan and the provider price that sells it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPrice {
    pub plan: Plan,
    pub price_id: String,
    pub unit_amount_cents: i64,
}

/// Immutable plan/price table injected at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    prices: Vec<PlanPrice>,
}

impl PlanCatalog {
    /// Pro at $9.99/month, Premium at $19.99/month
    pub fn new(pro_price_id: impl Into<String>, premium_price_id: impl Into<String>) -> Self {
        Self {
            prices: vec![
                PlanPrice {
                    plan: Plan::Pro,
                    price_id: pro_price_id.into(),
                    unit_amount_cents: 999,
                },
                PlanPrice {
                    plan: Plan::Premium,
                    price_id: premium_price_id.into(),
                    unit_amount_cents: 1999,
                },
            ],
        }
    }

    pub fn price_for(&self, plan: Plan) -> Option<&PlanPrice> {
        self.prices.iter().find(|p| p.plan == plan)
    }

    pub fn plan_for_price(&self, price_id: &str) -> Option<Plan> {
        self.prices
            .iter()
            .find(|p| p.price_id == price_id)
            .map(|p| p.plan)
    }

    pub fn prices(&self) -> &[PlanPrice] {
        &self.prices
    }
}

/// How inbound webhook envelopes are authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookSecurity {
    /// HMAC-SHA256 over `{timestamp}.{payload}` with the endpoint secret
    Signed { secret: String, tolerance: Duration },
    /// Development only. Every accepted event is logged as unverified.
    Unverified,
}

/// Provider-hosted page redirect targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectUrls {
    pub checkout_success: String,
    pub checkout_cancel: String,
    pub portal_return: String,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe_secret_key: String,
    pub webhook: WebhookSecurity,
    pub catalog: PlanCatalog,
    pub urls: RedirectUrls,
    pub claim_timeout: Duration,
    pub max_commit_attempts: u32,
    pub slack_webhook_url: Option<String>,
}

impl BillingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
        };

        let stripe_secret_key = require("STRIPE_SECRET_KEY")?;

        let tolerance_secs = parse_or(
            get("WEBHOOK_TOLERANCE_SECS"),
            "WEBHOOK_TOLERANCE_SECS",
            DEFAULT_WEBHOOK_TOLERANCE_SECS,
        )?;
        let production = get("APP_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);
        let allow_unverified = get("ALLOW_UNVERIFIED_WEBHOOKS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let webhook = match get("STRIPE_WEBHOOK_SECRET") {
            Some(secret) => WebhookSecurity::Signed {
                secret,
                tolerance: Duration::from_secs(tolerance_secs),
            },
            None if allow_unverified && !production => WebhookSecurity::Unverified,
            None if allow_unverified => {
                return Err(BillingError::Config(
                    "ALLOW_UNVERIFIED_WEBHOOKS cannot be used with APP_ENV=production".to_string(),
                ))
            }
            None => {
                return Err(BillingError::Config(
                    "STRIPE_WEBHOOK_SECRET must be set (or ALLOW_UNVERIFIED_WEBHOOKS=true outside production)"
                        .to_string(),
                ))
            }
        };

        let catalog = PlanCatalog::new(
            require("STRIPE_PRICE_PRO")?,
            require("STRIPE_PRICE_PREMIUM")?,
        );

        let app_url = get("APP_URL").unwrap_or_else(|| "http://localhost:3000".to_string());
        let urls = RedirectUrls {
            checkout_success: get("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|| format!("{}/account?checkout=success", app_url)),
            checkout_cancel: get("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|| format!("{}/account?checkout=cancelled", app_url)),
            portal_return: get("PORTAL_RETURN_URL")
                .unwrap_or_else(|| format!("{}/account", app_url)),
        };

        let claim_timeout = Duration::from_secs(parse_or(
            get("CLAIM_TIMEOUT_SECS"),
            "CLAIM_TIMEOUT_SECS",
            DEFAULT_CLAIM_TIMEOUT_SECS,
        )?);
        let max_commit_attempts = parse_or(
            get("MAX_COMMIT_ATTEMPTS"),
            "MAX_COMMIT_ATTEMPTS",
            DEFAULT_MAX_COMMIT_ATTEMPTS,
        )?;
        if max_commit_attempts == 0 {
            return Err(BillingError::Config(
                "MAX_COMMIT_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            stripe_secret_key,
            webhook,
            catalog,
            urls,
            claim_timeout,
            max_commit_attempts,
            slack_webhook_url: get("SLACK_BILLING_WEBHOOK_URL"),
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> BillingResult<T> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, v))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("STRIPE_SECRET_KEY", "sk_test_123"),
            ("STRIPE_PRICE_PRO", "price_pro"),
            ("STRIPE_PRICE_PREMIUM", "price_premium"),
        ]
    }

    #[test]
    fn test_catalog_maps_prices_both_ways() {
        let catalog = PlanCatalog::new("price_pro", "price_premium");
        assert_eq!(catalog.plan_for_price("price_premium"), Some(Plan::Premium));
        assert_eq!(catalog.plan_for_price("price_other"), None);
        assert_eq!(catalog.price_for(Plan::Pro).unwrap().unit_amount_cents, 999);
        assert!(catalog.price_for(Plan::Free).is_none());
    }

    #[test]
    fn test_signed_webhooks_with_default_tolerance() {
        let mut pairs = base();
        pairs.push(("STRIPE_WEBHOOK_SECRET", "whsec_abc"));
        let config = BillingConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(
            config.webhook,
            WebhookSecurity::Signed {
                secret: "whsec_abc".to_string(),
                tolerance: Duration::from_secs(300),
            }
        );
        assert_eq!(config.claim_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_commit_attempts, 5);
        assert_eq!(
            config.urls.portal_return,
            "http://localhost:3000/account".to_string()
        );
    }

    #[test]
    fn test_missing_secret_is_an_error_by_default() {
        let err = BillingConfig::from_lookup(lookup(&base())).unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[test]
    fn test_unverified_mode_requires_explicit_flag_outside_production() {
        let mut pairs = base();
        pairs.push(("ALLOW_UNVERIFIED_WEBHOOKS", "true"));
        let config = BillingConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.webhook, WebhookSecurity::Unverified);

        pairs.push(("APP_ENV", "production"));
        assert!(BillingConfig::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let mut pairs = base();
        pairs.push(("STRIPE_WEBHOOK_SECRET", "whsec_abc"));
        pairs.push(("WEBHOOK_TOLERANCE_SECS", "five minutes"));
        assert!(BillingConfig::from_lookup(lookup(&pairs)).is_err());
    }
}
