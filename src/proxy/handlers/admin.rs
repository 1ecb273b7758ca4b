use crate::constants;
use crate::proxy::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

pub async fn handle_list_models() -> Json<serde_json::Value> {
    let data: Vec<_> = constants::MODEL_CATALOG
        .iter()
        .map(|(id, family)| {
            json!({
                "type": "model",
                "id": id,
                "display_name": id,
                "family": family,
            })
        })
        .collect();
    Json(json!({ "data": data, "has_more": false }))
}

pub async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let accounts = state.pool.snapshot().await;
    let now = chrono::Utc::now().timestamp_millis();
    let usable = accounts
        .iter()
        .filter(|a| a.enabled && !a.invalid)
        .count();
    let limited = accounts
        .iter()
        .filter(|a| a.rate_limits.values().any(|s| s.is_active(now)))
        .count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": accounts.len(),
        "usable": usable,
        "rate_limited": limited,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLimitsQuery {
    #[serde(default)]
    pub include_history: bool,
}

// Per-account per-model quota snapshot for operators.
pub async fn handle_account_limits(
    State(state): State<AppState>,
    Query(query): Query<AccountLimitsQuery>,
) -> Json<serde_json::Value> {
    let accounts = state.pool.snapshot().await;
    let now = chrono::Utc::now().timestamp_millis();
    let entries: Vec<_> = accounts
        .iter()
        .map(|account| {
            let limits: serde_json::Map<String, serde_json::Value> = account
                .rate_limits
                .iter()
                .map(|(model, limit)| {
                    let mut entry = json!({
                        "rate_limited": limit.is_active(now),
                        "reset_at": chrono::DateTime::from_timestamp_millis(limit.reset_at)
                            .map(|dt| dt.to_rfc3339()),
                        "reset_in_ms": limit.remaining_ms(now),
                    });
                    if query.include_history {
                        entry["last_limited_at"] =
                            json!(chrono::DateTime::from_timestamp_millis(limit.last_limited_at)
                                .map(|dt| dt.to_rfc3339()));
                    }
                    (model.clone(), entry)
                })
                .collect();
            json!({
                "email": account.email,
                "enabled": account.enabled,
                "invalid": account.invalid,
                "health_score": account.health_score,
                "limits": limits,
            })
        })
        .collect();
    Json(json!({ "accounts": entries }))
}

pub async fn handle_refresh_token(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cleared = state.credentials.clear();
    Json(json!({ "cleared": cleared }))
}

pub async fn handle_accounts_reload(State(state): State<AppState>) -> Response {
    match state.pool.reload().await {
        Ok(count) => Json(json!({ "accounts": count })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "type": "error",
                "error": { "type": "api_error", "message": e }
            })),
        )
            .into_response(),
    }
}
