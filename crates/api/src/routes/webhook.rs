//! Provider webhook endpoint

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use resumely_billing::{ReconcileOutcome, SIGNATURE_HEADER};
use serde::Serialize;

use crate::{
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

/// Verify and reconcile one delivery
///
/// Every outcome the reconciler settles (including duplicates, ignored
/// types and dead-lettered events) is acknowledged with 200. Only a failed
/// verification is a 400; transient store failures are a 5xx so the
/// provider retries.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok());

    let outcome = state.billing.webhooks.ingest(&body, signature).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}
