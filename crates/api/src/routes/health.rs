use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Liveness plus a database ping
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database = match &state.pool {
        None => "not_configured",
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => "ok",
            Err(e) => {
                tracing::error!(error = %e, "Health check database ping failed");
                "unreachable"
            }
        },
    };

    let status = if database == "unreachable" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(json!({
            "status": if status.is_success() { "ok" } else { "degraded" },
            "database": database,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
