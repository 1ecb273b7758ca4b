use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

// The only error type the proxy core produces. Raw upstream status codes are
// categorised at the upstream client boundary and never inspected elsewhere.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("account is rate limited, resets in {reset_ms} ms")]
    RateLimit { reset_ms: u64 },

    #[error("authentication invalid: {0}")]
    AuthInvalid(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("all accounts exhausted until {reset_at_ms}")]
    Capacity { reset_at_ms: i64 },

    #[error("{0}")]
    Unknown(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

// Renders "1h 23m 45s" style durations for capacity messages.
pub fn format_reset(ms: u64) -> String {
    let total_secs = ms.div_ceil(1000);
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

impl ProxyError {
    // Rate-limit and capacity errors deliberately map to 400 so clients do
    // not auto-retry into a pool that cannot serve them yet.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RateLimit { .. } => StatusCode::BAD_REQUEST,
            ProxyError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Permission(_) => StatusCode::FORBIDDEN,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Capacity { .. } => StatusCode::BAD_REQUEST,
            ProxyError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::RateLimit { .. } => "invalid_request_error",
            ProxyError::AuthInvalid(_) => "authentication_error",
            ProxyError::Permission(_) => "permission_error",
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::Transient(_) => "api_error",
            ProxyError::Capacity { .. } => "invalid_request_error",
            ProxyError::Unknown(_) => "api_error",
        }
    }

    pub fn client_message(&self) -> String {
        match self {
            ProxyError::RateLimit { reset_ms } => format!(
                "Account pool has exhausted capacity for this model, resets in {}",
                format_reset(*reset_ms)
            ),
            ProxyError::Capacity { reset_at_ms } => {
                let when = chrono::DateTime::from_timestamp_millis(*reset_at_ms)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| reset_at_ms.to_string());
                format!("All accounts are rate limited; earliest reset at {}", when)
            }
            other => other.to_string(),
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.client_message(),
            }
        })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_body())).into_response()
    }
}
