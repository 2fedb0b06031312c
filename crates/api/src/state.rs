//! Application state

use std::sync::Arc;

use resumely_billing::BillingService;
use sqlx::PgPool;

use crate::auth::InternalToken;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// `None` when running without a database (health reports it)
    pub pool: Option<PgPool>,
    pub internal_token: Option<InternalToken>,
}

impl AppState {
    pub fn new(
        billing: Arc<BillingService>,
        pool: Option<PgPool>,
        internal_api_token: Option<String>,
    ) -> Self {
        let internal_token = internal_api_token.map(InternalToken::new);
        if internal_token.is_none() {
            tracing::warn!("INTERNAL_API_TOKEN not set; internal subscriber routes are disabled");
        }

        Self {
            billing,
            pool,
            internal_token,
        }
    }
}
