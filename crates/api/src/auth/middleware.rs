//! Bearer-token middleware for Axum

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Shared secret presented by the application backend
#[derive(Clone)]
pub struct InternalToken(Arc<str>);

impl InternalToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    /// Constant-time comparison
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl std::fmt::Debug for InternalToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InternalToken(..)")
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Middleware that requires the internal API token
pub async fn require_internal_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let result = match (&state.internal_token, extract_bearer_token(&request)) {
        (None, _) => Err(AuthError::Disabled),
        (Some(_), None) => Err(AuthError::MissingAuth),
        (Some(expected), Some(presented)) if expected.matches(presented) => Ok(()),
        (Some(_), Some(_)) => Err(AuthError::InvalidToken),
    };

    match result {
        Ok(()) => next.run(request).await,
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "Internal route authentication failed");
            err.into_response()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Internal routes disabled")]
    Disabled,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            // Indistinguishable from a bad token to the caller
            AuthError::Disabled => (StatusCode::UNAUTHORIZED, "Invalid token"),
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

    #[test]
    fn test_token_matches_exactly() {
        let token = InternalToken::new("s3cret-token");
        assert!(token.matches("s3cret-token"));
        assert!(!token.matches("s3cret-tokeN"));
        assert!(!token.matches("s3cret"));
        assert!(!token.matches(""));
    }

    #[test]
    fn test_debug_hides_token() {
        let token = InternalToken::new("s3cret-token");
        assert!(!format!("{:?}", token).contains("s3cret"));
    }
}
