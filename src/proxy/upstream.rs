use crate::auth::CredentialStore;
use crate::constants;
use crate::error::{ProxyError, ProxyResult};
use crate::models::AppConfig;
use crate::proxy::pool::{AccountPool, SelectedAccount, Selection};
use crate::proxy::rate_limit;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct UpstreamRequest {
    pub model: String,
    // The translated google-format request object.
    pub request: Value,
    pub streaming: bool,
    pub fingerprint: Option<String>,
    pub trace_id: String,
}

#[derive(Debug)]
pub struct UpstreamSuccess {
    pub email: String,
    pub response: reqwest::Response,
}

// Drives one client request against the pool: pick an account, walk the
// endpoint mirrors, classify failures, fail over. Raw status codes stop
// here; everything surfaces as a ProxyError category.
pub struct UpstreamClient {
    http: reqwest::Client,
    mirrors: Vec<String>,
    pool: Arc<AccountPool>,
    credentials: Arc<CredentialStore>,
    max_retries: u32,
}

enum MirrorOutcome {
    Success(reqwest::Response),
    // All mirrors rate limited; smallest parsed reset across them.
    RateLimited { min_reset_ms: Option<u64> },
    Transient(String),
    Terminal(ProxyError),
}

impl UpstreamClient {
    pub fn new(
        pool: Arc<AccountPool>,
        credentials: Arc<CredentialStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            http: crate::utils::http::build_upstream_client(config.request_timeout_secs)
                .expect("failed to build upstream HTTP client"),
            mirrors: constants::UPSTREAM_MIRRORS
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            pool,
            credentials,
            max_retries: config.max_retries,
        }
    }

    #[cfg(test)]
    pub fn with_mirrors(
        pool: Arc<AccountPool>,
        credentials: Arc<CredentialStore>,
        config: &AppConfig,
        mirrors: Vec<String>,
    ) -> Self {
        let mut client = Self::new(pool, credentials, config);
        client.mirrors = mirrors;
        client
    }

    pub async fn generate(&self, request: &UpstreamRequest) -> ProxyResult<UpstreamSuccess> {
        self.pool.reset_expired().await;
        let settings = self.pool.settings().await;
        let account_count = self.pool.len().await;
        let max_attempts = (self.max_retries as usize).max(account_count + 1);

        let mut last_error = "no attempt was made".to_string();
        let mut last_rate_limit_ms: Option<u64> = None;
        let mut slept_once = false;

        for attempt in 0..max_attempts {
            let account = match self
                .pool
                .select(&request.model, request.fingerprint.as_deref())
                .await
            {
                Selection::Account(account) => account,
                Selection::Empty => {
                    return Err(ProxyError::Transient(
                        "account pool has no usable accounts".into(),
                    ));
                }
                Selection::AllLimited { min_wait_ms, usable } => {
                    if min_wait_ms > settings.max_wait_before_error_ms {
                        return Err(ProxyError::Capacity {
                            reset_at_ms: chrono::Utc::now().timestamp_millis()
                                + min_wait_ms as i64,
                        });
                    }
                    // With one account a short sleep beats an error; with
                    // several, delaying silently is worse than failing fast.
                    if usable == 1 && !slept_once {
                        info!(
                            "[{}] single account rate limited, sleeping {} ms until reset",
                            request.trace_id, min_wait_ms
                        );
                        slept_once = true;
                        tokio::time::sleep(std::time::Duration::from_millis(min_wait_ms + 250))
                            .await;
                        self.pool.reset_expired().await;
                        continue;
                    }
                    return Err(ProxyError::Capacity {
                        reset_at_ms: chrono::Utc::now().timestamp_millis() + min_wait_ms as i64,
                    });
                }
            };

            debug!(
                "[{}] attempt {}/{} using account {}",
                request.trace_id,
                attempt + 1,
                max_attempts,
                account.email
            );

            let token = match self.credentials.access_token(&account).await {
                Ok(token) => token,
                Err(ProxyError::AuthInvalid(reason)) => {
                    self.pool.mark_invalid(&account.email, &reason).await;
                    last_error = format!("account {}: {}", account.email, reason);
                    continue;
                }
                Err(e) => {
                    self.pool.mark_failure(&account.email).await;
                    last_error = e.to_string();
                    continue;
                }
            };
            let project = self.credentials.project_id(&account, &token).await;
            if account.project_id.is_none() && project != constants::DEFAULT_PROJECT_ID {
                self.pool.set_project_id(&account.email, &project).await;
            }

            match self
                .try_mirrors(request, &account, token, &project)
                .await?
            {
                MirrorOutcome::Success(response) => {
                    self.pool.mark_success(&account.email).await;
                    return Ok(UpstreamSuccess {
                        email: account.email,
                        response,
                    });
                }
                MirrorOutcome::RateLimited { min_reset_ms } => {
                    self.pool
                        .mark_rate_limited(&account.email, &request.model, min_reset_ms)
                        .await;
                    last_rate_limit_ms =
                        Some(min_reset_ms.unwrap_or(settings.default_cooldown_ms));
                    last_error = format!("account {} rate limited on all mirrors", account.email);
                }
                MirrorOutcome::Transient(message) => {
                    self.pool.mark_failure(&account.email).await;
                    last_error = message;
                }
                MirrorOutcome::Terminal(error) => return Err(error),
            }
        }

        // A run that ended on rate limits renders as the parsed reset so
        // clients see when capacity returns; anything else is transient.
        if let Some(reset_ms) = last_rate_limit_ms {
            return Err(ProxyError::RateLimit { reset_ms });
        }
        Err(ProxyError::Transient(format!(
            "all {} attempts failed: {}",
            max_attempts, last_error
        )))
    }

    async fn try_mirrors(
        &self,
        request: &UpstreamRequest,
        account: &SelectedAccount,
        mut token: String,
        project: &str,
    ) -> ProxyResult<MirrorOutcome> {
        let method = if request.streaming {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let envelope = json!({
            "project": project,
            "model": request.model,
            "request": request.request,
            "userAgent": constants::USER_AGENT.as_str(),
            "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        });

        let mut min_reset_ms: Option<u64> = None;
        let mut limited_mirrors = 0usize;
        let mut transient: Option<String> = None;
        let mut auth_retried = false;

        let mut idx = 0;
        while idx < self.mirrors.len() {
            let mirror = &self.mirrors[idx];
            let url = if request.streaming {
                format!("{}:{}?alt=sse", mirror, method)
            } else {
                format!("{}:{}", mirror, method)
            };

            let mut builder = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .header("Content-Type", "application/json");
            if constants::is_claude_model(&request.model)
                && constants::is_thinking_model(&request.model)
            {
                builder = builder.header("anthropic-beta", constants::ANTHROPIC_THINKING_BETA);
            }

            let response = match builder.json(&envelope).send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!("[{}] mirror {} unreachable: {}", request.trace_id, url, e);
                    transient = Some(format!("mirror {} unreachable: {}", mirror, e));
                    idx += 1;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                if idx > 0 {
                    info!(
                        "[{}] mirror fallback succeeded on {}",
                        request.trace_id, mirror
                    );
                }
                return Ok(MirrorOutcome::Success(response));
            }

            match status {
                StatusCode::UNAUTHORIZED => {
                    // One in-request credential refresh; a second 401 means
                    // the account's auth is genuinely broken.
                    self.credentials.invalidate(&account.email);
                    if auth_retried {
                        return Ok(MirrorOutcome::Terminal(ProxyError::AuthInvalid(format!(
                            "account {} rejected twice after refresh",
                            account.email
                        ))));
                    }
                    auth_retried = true;
                    match self.credentials.access_token(account).await {
                        Ok(fresh) => {
                            token = fresh;
                            // Same mirror again with the fresh token.
                            continue;
                        }
                        Err(e) => return Ok(MirrorOutcome::Terminal(e)),
                    }
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let headers = response.headers().clone();
                    let body = response.text().await.unwrap_or_default();
                    let parsed = rate_limit::parse_reset_from_response(&headers, &body);
                    warn!(
                        "[{}] mirror {} returned 429 (reset {:?} ms)",
                        request.trace_id, mirror, parsed
                    );
                    min_reset_ms = match (min_reset_ms, parsed) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    limited_mirrors += 1;
                    idx += 1;
                }
                StatusCode::BAD_REQUEST => {
                    let body = response.text().await.unwrap_or_default();
                    return Ok(MirrorOutcome::Terminal(ProxyError::BadRequest(
                        extract_error_message(&body),
                    )));
                }
                StatusCode::FORBIDDEN => {
                    let body = response.text().await.unwrap_or_default();
                    return Ok(MirrorOutcome::Terminal(ProxyError::Permission(
                        extract_error_message(&body),
                    )));
                }
                other => {
                    let body = response.text().await.unwrap_or_default();
                    debug!(
                        "[{}] mirror {} returned {}: {}",
                        request.trace_id, mirror, other, body
                    );
                    transient = Some(format!("mirror {} returned {}", mirror, other));
                    idx += 1;
                }
            }
        }

        if limited_mirrors == self.mirrors.len() {
            return Ok(MirrorOutcome::RateLimited { min_reset_ms });
        }
        Ok(MirrorOutcome::Transient(transient.unwrap_or_else(|| {
            "all mirrors rate limited or failed".to_string()
        })))
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            let mut text = body.to_string();
            text.truncate(500);
            text
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, CredentialSource, PoolSettings, SelectionStrategy};
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct MockState {
        hits: Arc<AtomicUsize>,
    }

    async fn start_mock<H, T>(handler: H) -> (String, MockState)
    where
        H: axum::handler::Handler<T, MockState>,
        T: 'static,
    {
        let state = MockState::default();
        let app = Router::new()
            .route("/v1internal:generateContent", post(handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1internal", addr), state)
    }

    fn manual_account(email: &str, key: &str) -> Account {
        let mut account = Account::new(email.to_string(), CredentialSource::Manual);
        account.api_key = Some(key.to_string());
        account
    }

    async fn build_client(
        mirrors: Vec<String>,
        accounts: Vec<Account>,
        settings: PoolSettings,
    ) -> (UpstreamClient, Arc<AccountPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(AccountPool::new(
            dir.path().join("accounts.json"),
            settings,
        ));
        for account in accounts {
            pool.upsert_account(account).await.unwrap();
        }
        let credentials = Arc::new(CredentialStore::new(50));
        let config = AppConfig::default();
        let client =
            UpstreamClient::with_mirrors(pool.clone(), credentials, &config, mirrors);
        (client, pool, dir)
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest {
            model: "gemini-3-pro".into(),
            request: json!({"contents": []}),
            streaming: false,
            fingerprint: None,
            trace_id: "t0".into(),
        }
    }

    fn round_robin() -> PoolSettings {
        PoolSettings {
            strategy: SelectionStrategy::RoundRobin,
            ..PoolSettings::default()
        }
    }

    #[tokio::test]
    async fn success_on_first_mirror() {
        async fn ok(State(state): State<MockState>) -> axum::Json<Value> {
            state.hits.fetch_add(1, Ordering::SeqCst);
            axum::Json(json!({"response": {"candidates": []}}))
        }
        let (mirror, state) = start_mock(ok).await;
        let (client, _pool, _dir) = build_client(
            vec![mirror],
            vec![manual_account("a@x", "key-a")],
            round_robin(),
        )
        .await;
        let success = client.generate(&request()).await.unwrap();
        assert_eq!(success.email, "a@x");
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mirror_fallback_on_server_error() {
        async fn failing(State(state): State<MockState>) -> (axum::http::StatusCode, String) {
            state.hits.fetch_add(1, Ordering::SeqCst);
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom".into())
        }
        async fn ok() -> axum::Json<Value> {
            axum::Json(json!({"response": {"candidates": []}}))
        }
        let (bad_mirror, bad_state) = start_mock(failing).await;
        let (good_mirror, _) = start_mock(ok).await;
        let (client, _pool, _dir) = build_client(
            vec![bad_mirror, good_mirror],
            vec![manual_account("a@x", "key-a")],
            round_robin(),
        )
        .await;
        let success = client.generate(&request()).await.unwrap();
        assert_eq!(success.email, "a@x");
        assert_eq!(bad_state.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn account_failover_after_all_mirrors_rate_limited() {
        // Account A gets 429 everywhere; the next attempt selects B, which
        // succeeds. A must be marked rate limited for the model.
        async fn by_key(headers: HeaderMap) -> axum::response::Response {
            use axum::response::IntoResponse;
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if auth.ends_with("key-a") {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "60")],
                    r#"{"error":{"message":"quota exhausted"}}"#,
                )
                    .into_response()
            } else {
                axum::Json(json!({"response": {"candidates": []}})).into_response()
            }
        }
        let (mirror, _) = start_mock(by_key).await;
        let (client, pool, _dir) = build_client(
            vec![mirror],
            vec![manual_account("a@x", "key-a"), manual_account("b@x", "key-b")],
            round_robin(),
        )
        .await;
        let success = client.generate(&request()).await.unwrap();
        assert_eq!(success.email, "b@x");

        let snapshot = pool.snapshot().await;
        let account_a = snapshot.iter().find(|a| a.email == "a@x").unwrap();
        let limit = &account_a.rate_limits["gemini-3-pro"];
        assert!(limit.rate_limited);
        let wait = limit.reset_at - chrono::Utc::now().timestamp_millis();
        assert!((55_000..=60_500).contains(&wait), "wait {}", wait);
    }

    #[tokio::test]
    async fn capacity_error_when_wait_exceeds_ceiling() {
        // Single account, reset parsed as 5 minutes, ceiling 2 minutes:
        // immediate Capacity error carrying the reset time, no sleep.
        async fn limited() -> axum::response::Response {
            use axum::response::IntoResponse;
            (
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", "300")],
                "slow down",
            )
                .into_response()
        }
        let (mirror, _) = start_mock(limited).await;
        let (client, _pool, _dir) = build_client(
            vec![mirror],
            vec![manual_account("a@x", "key-a")],
            round_robin(),
        )
        .await;
        let started = std::time::Instant::now();
        let err = client.generate(&request()).await.unwrap_err();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        match err {
            ProxyError::Capacity { reset_at_ms } => {
                let wait = reset_at_ms - chrono::Utc::now().timestamp_millis();
                assert!((290_000..=301_000).contains(&wait), "wait {}", wait);
            }
            other => panic!("expected Capacity, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn single_account_sleeps_through_short_cooldown() {
        // One account, a sub-ceiling cooldown: the request waits out the
        // reset instead of erroring, then succeeds.
        async fn limited_once(State(state): State<MockState>) -> axum::response::Response {
            use axum::response::IntoResponse;
            if state.hits.fetch_add(1, Ordering::SeqCst) == 0 {
                (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
            } else {
                axum::Json(json!({"response": {"candidates": []}})).into_response()
            }
        }
        let (mirror, state) = start_mock(limited_once).await;
        let settings = PoolSettings {
            strategy: SelectionStrategy::RoundRobin,
            default_cooldown_ms: 500,
            ..PoolSettings::default()
        };
        let (client, _pool, _dir) = build_client(
            vec![mirror],
            vec![manual_account("a@x", "key-a")],
            settings,
        )
        .await;
        let started = std::time::Instant::now();
        let success = client.generate(&request()).await.unwrap();
        assert_eq!(success.email, "a@x");
        assert!(started.elapsed() >= std::time::Duration::from_millis(500));
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bad_request_is_terminal() {
        async fn bad(State(state): State<MockState>) -> (axum::http::StatusCode, String) {
            state.hits.fetch_add(1, Ordering::SeqCst);
            (
                axum::http::StatusCode::BAD_REQUEST,
                r#"{"error":{"message":"schema rejected"}}"#.into(),
            )
        }
        let (mirror, state) = start_mock(bad).await;
        let (client, _pool, _dir) = build_client(
            vec![mirror],
            vec![manual_account("a@x", "key-a"), manual_account("b@x", "key-b")],
            round_robin(),
        )
        .await;
        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(msg) if msg == "schema rejected"));
        // Terminal: no second mirror, no second account.
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_gets_one_refresh_then_fails() {
        async fn always_401(State(state): State<MockState>) -> (axum::http::StatusCode, String) {
            state.hits.fetch_add(1, Ordering::SeqCst);
            (axum::http::StatusCode::UNAUTHORIZED, "expired".into())
        }
        let (mirror, state) = start_mock(always_401).await;
        let (client, _pool, _dir) = build_client(
            vec![mirror],
            vec![manual_account("a@x", "key-a")],
            round_robin(),
        )
        .await;
        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::AuthInvalid(_)));
        // Exactly two tries on the same account: original + post-refresh.
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_pool_is_transient() {
        let (client, _pool, _dir) =
            build_client(vec!["http://127.0.0.1:1/v1internal".into()], vec![], round_robin())
                .await;
        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Transient(_)));
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"nope"}}"#),
            "nope"
        );
        assert_eq!(extract_error_message("plain text"), "plain text");
    }
}
