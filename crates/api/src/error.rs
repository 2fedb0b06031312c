//! API error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use resumely_billing::{BillingError, GatewayError};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Billing provider error: {0}")]
    BadGateway(String),

    /// Retryable; the webhook provider redelivers on this
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidWebhook(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Verification(v) => ApiError::InvalidWebhook(v.to_string()),
            BillingError::SubscriberNotFound(id) => {
                ApiError::NotFound(format!("subscriber {}", id))
            }
            BillingError::InvalidState(msg) => ApiError::Conflict(msg),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::Gateway(g) => match g {
                GatewayError::PlanNotPurchasable(_) => ApiError::Validation(g.to_string()),
                GatewayError::NoBillingCustomer(_) => ApiError::Conflict(g.to_string()),
                GatewayError::Transient(_) => ApiError::Unavailable(g.to_string()),
                GatewayError::Permanent(_) | GatewayError::IncompleteResponse(_) => {
                    ApiError::BadGateway(g.to_string())
                }
            },
            other if other.is_transient() => ApiError::Unavailable(other.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Internals stay in the logs
            ApiError::Unavailable(detail) | ApiError::Internal(detail) => {
                tracing::error!(status = status.as_u16(), error = %detail, "Request failed");
                if status == StatusCode::SERVICE_UNAVAILABLE {
                    "Temporarily unavailable, retry later".to_string()
                } else {
                    "Internal server error".to_string()
                }
            }
            ApiError::BadGateway(detail) => {
                tracing::warn!(error = %detail, "Billing provider call failed");
                "Billing provider error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resumely_billing::{Plan, VerificationError};
    use uuid::Uuid;

    #[test]
    fn test_verification_failure_is_bad_request() {
        let err: ApiError = BillingError::Verification(VerificationError::SignatureMismatch).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_transient_store_failure_is_retryable() {
        let err: ApiError = BillingError::Database("connection refused".into()).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError = BillingError::CommitContention {
            subscriber_id: Uuid::nil(),
            attempts: 5,
        }
        .into();
        assert!(err.status().is_server_error());
    }

    #[test]
    fn test_gateway_errors() {
        let err: ApiError = BillingError::Gateway(GatewayError::PlanNotPurchasable(Plan::Free)).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = BillingError::Gateway(GatewayError::Permanent("No such price".into())).into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err: ApiError = BillingError::Gateway(GatewayError::Transient("429".into())).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_domain_errors() {
        let err: ApiError = BillingError::SubscriberNotFound(Uuid::nil()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: ApiError = BillingError::InvalidState("already free".into()).into();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err: ApiError = BillingError::CorruptRecord("bad plan".into()).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
