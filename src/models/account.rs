use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    // Refresh token obtained through the PKCE flow.
    Oauth,
    // Static key pasted by the operator.
    Manual,
    // Scraped from the host IDE's state database.
    Database,
}

// Per (account, model) rate-limit state. A `reset_at` in the past means the
// pair is available again; readers treat expiry as the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRateLimitState {
    pub rate_limited: bool,
    // Unix millis.
    pub reset_at: i64,
    pub last_limited_at: i64,
}

impl ModelRateLimitState {
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.rate_limited && self.reset_at > now_ms
    }

    pub fn remaining_ms(&self, now_ms: i64) -> Option<u64> {
        if self.is_active(now_ms) {
            Some((self.reset_at - now_ms) as u64)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: f64,
    // Unix millis of the last refill.
    pub last_refill: i64,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self {
            tokens: 0.0,
            last_refill: 0,
        }
    }
}

impl TokenBucket {
    pub fn refill(&mut self, now_ms: i64, tokens_per_minute: f64, max_tokens: f64) {
        if self.last_refill == 0 {
            self.tokens = max_tokens;
            self.last_refill = now_ms;
            return;
        }
        let elapsed_min = (now_ms - self.last_refill).max(0) as f64 / 60_000.0;
        self.tokens = (self.tokens + elapsed_min * tokens_per_minute).min(max_tokens);
        self.last_refill = now_ms;
    }

    pub fn take(&mut self) {
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub source: CredentialSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    // Unix seconds.
    pub added_at: i64,
    #[serde(default)]
    pub last_used: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rate_limits: HashMap<String, ModelRateLimitState>,
    #[serde(default = "default_health")]
    pub health_score: i32,
    #[serde(default)]
    pub bucket: TokenBucket,
    #[serde(default)]
    pub consecutive_failures: u32,
    // Unix millis of the first rate-limit in the current failure window.
    #[serde(default)]
    pub failure_window_start: i64,
    // Unix millis of the last passive health recovery tick.
    #[serde(default)]
    pub last_recovery_at: i64,
}

fn default_true() -> bool {
    true
}

fn default_health() -> i32 {
    100
}

impl Account {
    pub fn new(email: String, source: CredentialSource) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            email,
            source,
            refresh_token: None,
            api_key: None,
            project_id: None,
            enabled: true,
            invalid: false,
            invalid_reason: None,
            added_at: now,
            last_used: now,
            rate_limits: HashMap::new(),
            health_score: default_health(),
            bucket: TokenBucket::default(),
            consecutive_failures: 0,
            failure_window_start: 0,
            last_recovery_at: now * 1000,
        }
    }

    pub fn oauth(email: String, refresh_token: String) -> Self {
        let mut account = Self::new(email, CredentialSource::Oauth);
        account.refresh_token = Some(refresh_token);
        account
    }

    // Availability for one model: enabled, not invalid, and no live
    // rate-limit entry for that model.
    pub fn is_available_for(&self, model: &str, now_ms: i64) -> bool {
        if !self.enabled || self.invalid {
            return false;
        }
        match self.rate_limits.get(model) {
            Some(state) => !state.is_active(now_ms),
            None => true,
        }
    }

    pub fn remaining_wait_ms(&self, model: &str, now_ms: i64) -> Option<u64> {
        self.rate_limits
            .get(model)
            .and_then(|s| s.remaining_ms(now_ms))
    }

    pub fn drop_expired_limits(&mut self, now_ms: i64) {
        self.rate_limits.retain(|_, s| s.is_active(now_ms));
    }

    pub fn mark_used(&mut self) {
        self.last_used = chrono::Utc::now().timestamp();
    }
}
