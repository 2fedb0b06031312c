//! Internal subscriber routes
//!
//! Called by the application backend, never by browsers. Plan and status
//! are read-only here; only the reconciler writes them.

use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use resumely_billing::{DowngradeReceipt, Entitlement, EventStatus, Plan, WebhookEventRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub plan: String,
}

#[derive(Debug, Serialize)]
pub struct RedirectResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookListResponse {
    pub events: Vec<WebhookEventRecord>,
    pub limit: i64,
    pub offset: i64,
}

// =============================================================================
// Handlers
// =============================================================================

/// Create the Free subscriber for a newly registered user
pub async fn register_subscriber(
    State(state): State<AppState>,
    Path(subscriber_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Entitlement>)> {
    let subscriber = state.billing.webhooks.register(subscriber_id).await?;
    Ok((StatusCode::CREATED, Json(Entitlement::from(&subscriber))))
}

pub async fn get_entitlement(
    State(state): State<AppState>,
    Path(subscriber_id): Path<Uuid>,
) -> ApiResult<Json<Entitlement>> {
    Ok(Json(state.billing.webhooks.entitlement(subscriber_id).await?))
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Path(subscriber_id): Path<Uuid>,
    Json(body): Json<CheckoutBody>,
) -> ApiResult<Json<RedirectResponse>> {
    let plan = Plan::from_str(&body.plan).map_err(|e| ApiError::Validation(e.to_string()))?;
    let url = state
        .billing
        .create_checkout_session(subscriber_id, plan)
        .await?;

    tracing::info!(subscriber_id = %subscriber_id, plan = %plan, "Checkout session created");
    Ok(Json(RedirectResponse { url }))
}

pub async fn create_portal(
    State(state): State<AppState>,
    Path(subscriber_id): Path<Uuid>,
) -> ApiResult<Json<RedirectResponse>> {
    let url = state.billing.create_portal_session(subscriber_id).await?;
    Ok(Json(RedirectResponse { url }))
}

/// Schedule the move to Free at the end of the paid period
pub async fn request_downgrade(
    State(state): State<AppState>,
    Path(subscriber_id): Path<Uuid>,
) -> ApiResult<Json<DowngradeReceipt>> {
    Ok(Json(state.billing.request_downgrade(subscriber_id).await?))
}

/// Event store listing, newest first
pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            EventStatus::parse(s)
                .ok_or_else(|| ApiError::Validation(format!("unknown event status '{}'", s)))
        })
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let events = state
        .billing
        .webhooks
        .list_events(status, limit, offset)
        .await?;

    Ok(Json(WebhookListResponse {
        events,
        limit,
        offset,
    }))
}
