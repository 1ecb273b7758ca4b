use crate::models::{Account, ModelRateLimitState, PoolSettings, SelectionStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// How far apart rate-limits may land and still count as "consecutive" for
// the extended-cooldown escalation.
const FAILURE_WINDOW_MS: i64 = 600_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolDocument {
    version: String,
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    cursor: usize,
    #[serde(default)]
    settings: PoolSettings,
}

// Snapshot handed to the upstream client; holds everything needed to build
// credentials without touching the pool lock again.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub email: String,
    pub source: crate::models::CredentialSource,
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
}

impl SelectedAccount {
    fn from_account(account: &Account) -> Self {
        Self {
            email: account.email.clone(),
            source: account.source,
            refresh_token: account.refresh_token.clone(),
            api_key: account.api_key.clone(),
            project_id: account.project_id.clone(),
        }
    }
}

#[derive(Debug)]
pub enum Selection {
    Account(SelectedAccount),
    // Every otherwise-usable account is rate limited for the model.
    AllLimited { min_wait_ms: u64, usable: usize },
    // Nothing enabled and valid remains.
    Empty,
}

struct PoolState {
    accounts: Vec<Account>,
    cursor: usize,
    // fingerprint -> email; in-memory only, reset when an account goes away.
    sticky: HashMap<String, String>,
    settings: PoolSettings,
}

// The pool's mutable state lives behind one mutex; every mutation persists
// the whole document with a tmp-then-rename write while still holding the
// lock, which keeps writers single-file.
pub struct AccountPool {
    state: Mutex<PoolState>,
    path: PathBuf,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl AccountPool {
    pub fn new(path: PathBuf, settings: PoolSettings) -> Self {
        Self {
            state: Mutex::new(PoolState {
                accounts: Vec::new(),
                cursor: 0,
                sticky: HashMap::new(),
                settings,
            }),
            path,
        }
    }

    // Loads the persisted document, clamps the cursor and drops rate-limit
    // entries that expired while the process was down.
    pub fn load(path: PathBuf, fallback_settings: PoolSettings) -> Result<Self, String> {
        let pool = Self::new(path.clone(), fallback_settings);
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| format!("failed to read pool file: {}", e))?;
            let mut doc: PoolDocument = serde_json::from_str(&content)
                .map_err(|e| format!("failed to parse pool file: {}", e))?;
            let now = now_ms();
            for account in &mut doc.accounts {
                account.drop_expired_limits(now);
            }
            let count = doc.accounts.len();
            let mut state = pool.state.try_lock().expect("fresh pool lock");
            state.cursor = if count == 0 { 0 } else { doc.cursor % count };
            state.accounts = doc.accounts;
            state.settings = doc.settings;
            info!("loaded {} account(s) from {:?}", count, path);
        }
        Ok(pool)
    }

    pub async fn reload(&self) -> Result<usize, String> {
        if !self.path.exists() {
            return Err(format!("pool file does not exist: {:?}", self.path));
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| format!("failed to read pool file: {}", e))?;
        let mut doc: PoolDocument = serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse pool file: {}", e))?;
        let now = now_ms();
        for account in &mut doc.accounts {
            account.drop_expired_limits(now);
        }
        let count = doc.accounts.len();
        let mut state = self.state.lock().await;
        state.cursor = if count == 0 { 0 } else { doc.cursor % count };
        state.accounts = doc.accounts;
        state.settings = doc.settings;
        state.sticky.clear();
        Ok(count)
    }

    fn persist_locked(&self, state: &PoolState) {
        let doc = PoolDocument {
            version: "1".to_string(),
            accounts: state.accounts.clone(),
            cursor: state.cursor,
            settings: state.settings.clone(),
        };
        if let Err(e) = write_atomic(&self.path, &doc) {
            warn!("failed to persist pool state: {}", e);
        }
    }

    pub async fn settings(&self) -> PoolSettings {
        self.state.lock().await.settings.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<Account> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn upsert_account(&self, account: Account) -> Result<(), String> {
        let mut state = self.state.lock().await;
        match state
            .accounts
            .iter()
            .position(|a| a.email == account.email)
        {
            Some(idx) => state.accounts[idx] = account,
            None => {
                if state.accounts.len() >= state.settings.max_accounts {
                    return Err(format!(
                        "account limit reached ({} max)",
                        state.settings.max_accounts
                    ));
                }
                state.accounts.push(account);
            }
        }
        self.persist_locked(&state);
        Ok(())
    }

    pub async fn remove_account(&self, email: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.accounts.len();
        state.accounts.retain(|a| a.email != email);
        let removed = state.accounts.len() != before;
        if removed {
            // Sticky bindings do not survive account removal.
            state.sticky.retain(|_, bound| bound != email);
            let len = state.accounts.len();
            if len > 0 {
                state.cursor %= len;
            } else {
                state.cursor = 0;
            }
            self.persist_locked(&state);
        }
        removed
    }

    pub async fn select(&self, model: &str, fingerprint: Option<&str>) -> Selection {
        self.select_at(model, fingerprint, now_ms()).await
    }

    pub async fn select_at(&self, model: &str, fingerprint: Option<&str>, now: i64) -> Selection {
        let mut state = self.state.lock().await;
        let settings = state.settings.clone();

        for account in &mut state.accounts {
            apply_passive_recovery(account, now, &settings);
        }

        let usable: Vec<usize> = state
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.enabled && !a.invalid)
            .map(|(i, _)| i)
            .collect();
        if usable.is_empty() {
            return Selection::Empty;
        }

        let available: Vec<usize> = usable
            .iter()
            .copied()
            .filter(|&i| state.accounts[i].is_available_for(model, now))
            .collect();
        if available.is_empty() {
            let min_wait_ms = usable
                .iter()
                .filter_map(|&i| state.accounts[i].remaining_wait_ms(model, now))
                .min()
                .unwrap_or(settings.default_cooldown_ms);
            return Selection::AllLimited {
                min_wait_ms,
                usable: usable.len(),
            };
        }

        let chosen = match settings.strategy {
            SelectionStrategy::Sticky => select_sticky(&state, &available, fingerprint),
            SelectionStrategy::RoundRobin => select_round_robin(&state, &available),
            SelectionStrategy::Hybrid => {
                select_hybrid(&mut state, &available, fingerprint, now, &settings)
            }
        };

        let account = &mut state.accounts[chosen];
        account.mark_used();
        let selected = SelectedAccount::from_account(account);
        if let Some(fp) = fingerprint {
            state.sticky.insert(fp.to_string(), selected.email.clone());
        }
        state.cursor = (chosen + 1) % state.accounts.len();
        self.persist_locked(&state);
        debug!("selected account {} for {}", selected.email, model);
        Selection::Account(selected)
    }

    pub async fn mark_rate_limited(&self, email: &str, model: &str, reset_ms: Option<u64>) {
        self.mark_rate_limited_at(email, model, reset_ms, now_ms())
            .await
    }

    // Repeated marks inside the dedup window are dropped so parallel
    // in-flight requests cannot compound the cooldown. Sustained limiting
    // escalates to the extended cooldown.
    pub async fn mark_rate_limited_at(
        &self,
        email: &str,
        model: &str,
        reset_ms: Option<u64>,
        now: i64,
    ) {
        let mut state = self.state.lock().await;
        let settings = state.settings.clone();
        let Some(idx) = state.accounts.iter().position(|a| a.email == email) else {
            return;
        };
        let account = &mut state.accounts[idx];

        if let Some(existing) = account.rate_limits.get(model) {
            if now - existing.last_limited_at < settings.rate_limit_dedup_window_ms as i64 {
                debug!(
                    "suppressing duplicate rate-limit mark for {} / {} inside dedup window",
                    email, model
                );
                return;
            }
        }

        if now - account.failure_window_start > FAILURE_WINDOW_MS {
            account.failure_window_start = now;
            account.consecutive_failures = 0;
        }
        account.consecutive_failures += 1;

        let cooldown_ms = if account.consecutive_failures >= settings.max_consecutive_failures {
            warn!(
                "account {} hit {} consecutive rate limits, applying extended cooldown",
                email, account.consecutive_failures
            );
            settings.extended_cooldown_ms
        } else {
            reset_ms.unwrap_or(settings.default_cooldown_ms)
        };

        account.rate_limits.insert(
            model.to_string(),
            ModelRateLimitState {
                rate_limited: true,
                reset_at: now + cooldown_ms as i64,
                last_limited_at: now,
            },
        );
        account.health_score =
            (account.health_score - settings.hybrid.rate_limit_penalty).max(0);
        info!(
            "account {} rate limited on {} for {} ms",
            email, model, cooldown_ms
        );
        self.persist_locked(&state);
    }

    pub async fn mark_success(&self, email: &str) {
        let mut state = self.state.lock().await;
        let settings = state.settings.clone();
        let Some(idx) = state.accounts.iter().position(|a| a.email == email) else {
            return;
        };
        let account = &mut state.accounts[idx];
        account.health_score =
            (account.health_score + settings.hybrid.reward).min(settings.hybrid.max_score);
        account.consecutive_failures = 0;
        self.persist_locked(&state);
    }

    pub async fn mark_failure(&self, email: &str) {
        let mut state = self.state.lock().await;
        let settings = state.settings.clone();
        let Some(idx) = state.accounts.iter().position(|a| a.email == email) else {
            return;
        };
        let account = &mut state.accounts[idx];
        account.health_score = (account.health_score - settings.hybrid.failure_penalty).max(0);
        self.persist_locked(&state);
    }

    pub async fn mark_invalid(&self, email: &str, reason: &str) {
        let mut state = self.state.lock().await;
        if let Some(idx) = state.accounts.iter().position(|a| a.email == email) {
            let account = &mut state.accounts[idx];
            account.invalid = true;
            account.invalid_reason = Some(reason.to_string());
            warn!("account {} marked invalid: {}", email, reason);
        }
        state.sticky.retain(|_, bound| bound != email);
        self.persist_locked(&state);
    }

    pub async fn set_project_id(&self, email: &str, project_id: &str) {
        let mut state = self.state.lock().await;
        let Some(idx) = state.accounts.iter().position(|a| a.email == email) else {
            return;
        };
        state.accounts[idx].project_id = Some(project_id.to_string());
        self.persist_locked(&state);
    }

    // Transitions expired (account, model) pairs back to available.
    pub async fn reset_expired(&self) {
        let now = now_ms();
        let mut state = self.state.lock().await;
        let mut dropped = 0usize;
        for account in &mut state.accounts {
            let before = account.rate_limits.len();
            account.drop_expired_limits(now);
            dropped += before - account.rate_limits.len();
        }
        if dropped > 0 {
            debug!("cleared {} expired rate-limit entries", dropped);
            self.persist_locked(&state);
        }
    }
}

fn apply_passive_recovery(account: &mut Account, now: i64, settings: &PoolSettings) {
    if account.last_recovery_at == 0 {
        account.last_recovery_at = now;
        return;
    }
    let hours = (now - account.last_recovery_at) / 3_600_000;
    if hours > 0 {
        account.health_score = (account.health_score
            + settings.hybrid.recovery_per_hour * hours as i32)
            .min(settings.hybrid.max_score);
        account.last_recovery_at += hours * 3_600_000;
    }
}

// Sticky: last account used for this fingerprint, else the lowest-indexed
// available one. Keeps the upstream prompt cache warm.
fn select_sticky(state: &PoolState, available: &[usize], fingerprint: Option<&str>) -> usize {
    if let Some(fp) = fingerprint {
        if let Some(bound) = state.sticky.get(fp) {
            if let Some(&idx) = available
                .iter()
                .find(|&&i| &state.accounts[i].email == bound)
            {
                return idx;
            }
        }
    }
    available[0]
}

fn select_round_robin(state: &PoolState, available: &[usize]) -> usize {
    let len = state.accounts.len();
    for offset in 0..len {
        let idx = (state.cursor + offset) % len;
        if available.contains(&idx) {
            return idx;
        }
    }
    available[0]
}

// Hybrid: health plus weighted bucket tokens; the sticky account wins when
// it scores within the configured margin of the best candidate.
fn select_hybrid(
    state: &mut PoolState,
    available: &[usize],
    fingerprint: Option<&str>,
    now: i64,
    settings: &PoolSettings,
) -> usize {
    for &idx in available {
        state.accounts[idx].bucket.refill(
            now,
            settings.hybrid.tokens_per_minute,
            settings.hybrid.max_bucket_tokens,
        );
    }

    let score = |state: &PoolState, idx: usize| -> f64 {
        let account = &state.accounts[idx];
        account.health_score as f64 + account.bucket.tokens * settings.hybrid.bucket_weight
    };

    let mut candidates: Vec<usize> = available
        .iter()
        .copied()
        .filter(|&i| state.accounts[i].health_score >= settings.hybrid.min_usable)
        .collect();
    if candidates.is_empty() {
        candidates = available.to_vec();
    }

    let best = candidates
        .iter()
        .copied()
        .max_by(|&a, &b| {
            score(state, a)
                .partial_cmp(&score(state, b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("candidates not empty");
    let best_score = score(state, best);

    let mut chosen = best;
    if let Some(fp) = fingerprint {
        if let Some(bound) = state.sticky.get(fp).cloned() {
            if let Some(&idx) = candidates
                .iter()
                .find(|&&i| state.accounts[i].email == bound)
            {
                if score(state, idx) >= best_score - settings.hybrid.sticky_margin {
                    chosen = idx;
                }
            }
        }
    }
    state.accounts[chosen].bucket.take();
    chosen
}

fn write_atomic(path: &Path, doc: &PoolDocument) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("create dir: {}", e))?;
    }
    let content =
        serde_json::to_string_pretty(doc).map_err(|e| format!("serialize pool: {}", e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).map_err(|e| format!("write tmp: {}", e))?;
    std::fs::rename(&tmp, path).map_err(|e| format!("rename tmp: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_pool(
        strategy: SelectionStrategy,
        emails: &[&str],
    ) -> (AccountPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = PoolSettings::default();
        settings.strategy = strategy;
        let pool = AccountPool::new(dir.path().join("accounts.json"), settings);
        for email in emails {
            let account = Account::oauth((*email).to_string(), format!("rt-{}", email));
            pool.upsert_account(account).await.unwrap();
        }
        (pool, dir)
    }

    fn email(selection: Selection) -> String {
        match selection {
            Selection::Account(a) => a.email,
            other => panic!("expected an account, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn round_robin_advances_past_unavailable() {
        let (pool, _dir) = temp_pool(SelectionStrategy::RoundRobin, &["a@x", "b@x", "c@x"]).await;
        let now = 1_000_000;
        assert_eq!(email(pool.select_at("m", None, now).await), "a@x");
        assert_eq!(email(pool.select_at("m", None, now).await), "b@x");
        pool.mark_rate_limited_at("c@x", "m", Some(60_000), now).await;
        // c is limited, cursor points at it; selection skips to a.
        assert_eq!(email(pool.select_at("m", None, now).await), "a@x");
    }

    #[tokio::test]
    async fn selection_availability_invariant() {
        // Whenever at least one account is usable for the model, a usable
        // account comes back.
        let (pool, _dir) = temp_pool(SelectionStrategy::Hybrid, &["a@x", "b@x"]).await;
        let now = 1_000_000;
        pool.mark_rate_limited_at("a@x", "m", Some(30_000), now).await;
        pool.mark_invalid("b@x", "bad grant").await;
        let account = Account::oauth("c@x".into(), "rt-c".into());
        pool.upsert_account(account).await.unwrap();
        assert_eq!(email(pool.select_at("m", None, now).await), "c@x");
    }

    #[tokio::test]
    async fn sticky_prefers_bound_account() {
        let (pool, _dir) = temp_pool(SelectionStrategy::Sticky, &["a@x", "b@x"]).await;
        let now = 1_000_000;
        assert_eq!(email(pool.select_at("m", Some("fp1"), now).await), "a@x");
        // Bound account is reused even when another is equally available.
        assert_eq!(email(pool.select_at("m", Some("fp1"), now).await), "a@x");
        // Binding is dropped when the account is rate limited.
        pool.mark_rate_limited_at("a@x", "m", Some(60_000), now).await;
        assert_eq!(email(pool.select_at("m", Some("fp1"), now).await), "b@x");
    }

    #[tokio::test]
    async fn sticky_binding_resets_on_account_removal() {
        let (pool, _dir) = temp_pool(SelectionStrategy::Sticky, &["a@x", "b@x"]).await;
        let now = 1_000_000;
        assert_eq!(email(pool.select_at("m", Some("fp1"), now).await), "a@x");
        pool.remove_account("a@x").await;
        assert_eq!(email(pool.select_at("m", Some("fp1"), now).await), "b@x");
    }

    #[tokio::test]
    async fn no_double_cooldown_inside_dedup_window() {
        let (pool, _dir) = temp_pool(SelectionStrategy::RoundRobin, &["a@x"]).await;
        let now = 1_000_000;
        pool.mark_rate_limited_at("a@x", "m", Some(60_000), now).await;
        let reset_before = pool.snapshot().await[0].rate_limits["m"].reset_at;
        // Concurrent in-flight requests report the same 429 a moment later.
        pool.mark_rate_limited_at("a@x", "m", Some(300_000), now + 1_000)
            .await;
        let reset_after = pool.snapshot().await[0].rate_limits["m"].reset_at;
        assert_eq!(reset_before, reset_after);
    }

    #[tokio::test]
    async fn marks_outside_dedup_window_do_extend() {
        let (pool, _dir) = temp_pool(SelectionStrategy::RoundRobin, &["a@x"]).await;
        let now = 1_000_000;
        pool.mark_rate_limited_at("a@x", "m", Some(10_000), now).await;
        pool.mark_rate_limited_at("a@x", "m", Some(60_000), now + 6_000)
            .await;
        let reset = pool.snapshot().await[0].rate_limits["m"].reset_at;
        assert_eq!(reset, now + 6_000 + 60_000);
    }

    #[tokio::test]
    async fn consecutive_failures_escalate_to_extended_cooldown() {
        let (pool, _dir) = temp_pool(SelectionStrategy::RoundRobin, &["a@x"]).await;
        let settings = pool.settings().await;
        let now = 1_000_000;
        let step = settings.rate_limit_dedup_window_ms as i64 + 1_000;
        for i in 0..settings.max_consecutive_failures as i64 {
            pool.mark_rate_limited_at("a@x", "m", Some(1_000), now + i * step)
                .await;
        }
        let last_mark = now + (settings.max_consecutive_failures as i64 - 1) * step;
        let reset = pool.snapshot().await[0].rate_limits["m"].reset_at;
        assert_eq!(reset, last_mark + settings.extended_cooldown_ms as i64);
    }

    #[tokio::test]
    async fn all_limited_reports_min_wait() {
        let (pool, _dir) = temp_pool(SelectionStrategy::Hybrid, &["a@x", "b@x"]).await;
        let now = 1_000_000;
        pool.mark_rate_limited_at("a@x", "m", Some(90_000), now).await;
        pool.mark_rate_limited_at("b@x", "m", Some(30_000), now).await;
        match pool.select_at("m", None, now + 1).await {
            Selection::AllLimited { min_wait_ms, usable } => {
                assert_eq!(usable, 2);
                assert!((29_000..=30_000).contains(&min_wait_ms), "{}", min_wait_ms);
            }
            other => panic!("expected AllLimited, got {:?}", other),
        }
        // A different model is unaffected by those marks.
        assert!(matches!(
            pool.select_at("other-model", None, now + 1).await,
            Selection::Account(_)
        ));
    }

    #[tokio::test]
    async fn account_failover_and_recovery() {
        // A returns 429 with a 60s delay; the next request selects B; after
        // the reset A is available again.
        let (pool, _dir) = temp_pool(SelectionStrategy::RoundRobin, &["a@x", "b@x"]).await;
        let now = 1_000_000;
        assert_eq!(email(pool.select_at("m", None, now).await), "a@x");
        pool.mark_rate_limited_at("a@x", "m", Some(60_000), now).await;
        assert_eq!(email(pool.select_at("m", None, now).await), "b@x");
        assert_eq!(email(pool.select_at("m", None, now + 60_001).await), "a@x");
    }

    #[tokio::test]
    async fn empty_pool_reports_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AccountPool::new(dir.path().join("accounts.json"), PoolSettings::default());
        assert!(matches!(pool.select("m", None).await, Selection::Empty));
    }

    #[tokio::test]
    async fn hybrid_prefers_healthier_account() {
        let (pool, _dir) = temp_pool(SelectionStrategy::Hybrid, &["a@x", "b@x"]).await;
        let now = 1_000_000;
        for _ in 0..3 {
            pool.mark_failure("a@x").await;
        }
        assert_eq!(email(pool.select_at("m", None, now).await), "b@x");
    }

    #[tokio::test]
    async fn hybrid_skips_accounts_below_min_usable_unless_all_are() {
        let (pool, _dir) = temp_pool(SelectionStrategy::Hybrid, &["a@x", "b@x"]).await;
        let now = 1_000_000;
        for _ in 0..5 {
            pool.mark_failure("a@x").await;
        }
        // a is at health 0, below min_usable; b wins regardless of buckets.
        assert_eq!(email(pool.select_at("m", None, now).await), "b@x");
        for _ in 0..5 {
            pool.mark_failure("b@x").await;
        }
        // All below the floor: selection still returns something.
        assert!(matches!(
            pool.select_at("m", None, now).await,
            Selection::Account(_)
        ));
    }

    #[tokio::test]
    async fn health_clamps_and_passively_recovers() {
        let (pool, _dir) = temp_pool(SelectionStrategy::Hybrid, &["a@x"]).await;
        let settings = pool.settings().await;
        for _ in 0..20 {
            pool.mark_failure("a@x").await;
        }
        assert_eq!(pool.snapshot().await[0].health_score, 0);
        for _ in 0..300 {
            pool.mark_success("a@x").await;
        }
        assert_eq!(
            pool.snapshot().await[0].health_score,
            settings.hybrid.max_score
        );
        // Passive recovery: two hours at +2/hour.
        for _ in 0..20 {
            pool.mark_failure("a@x").await;
        }
        let base = pool.snapshot().await[0].last_recovery_at;
        let _ = pool.select_at("m", None, base + 2 * 3_600_000).await;
        assert_eq!(
            pool.snapshot().await[0].health_score,
            2 * settings.hybrid.recovery_per_hour
        );
    }

    #[tokio::test]
    async fn persistence_round_trip_preserves_next_pick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let mut settings = PoolSettings::default();
        settings.strategy = SelectionStrategy::RoundRobin;
        let pool = AccountPool::new(path.clone(), settings.clone());
        for email_str in ["a@x", "b@x", "c@x"] {
            pool.upsert_account(Account::oauth(email_str.into(), "rt".into()))
                .await
                .unwrap();
        }
        let now = 1_000_000;
        assert_eq!(email(pool.select_at("m", None, now).await), "a@x");

        // A reloaded process picks exactly what this one would have.
        let reloaded = AccountPool::load(path, settings).unwrap();
        assert_eq!(email(reloaded.select_at("m", None, now).await), "b@x");
        assert_eq!(email(pool.select_at("m", None, now).await), "b@x");
    }

    #[tokio::test]
    async fn load_drops_expired_entries_and_clamps_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let mut account = Account::oauth("a@x".into(), "rt".into());
        account.rate_limits.insert(
            "m".into(),
            ModelRateLimitState {
                rate_limited: true,
                reset_at: 1, // long expired
                last_limited_at: 0,
            },
        );
        let doc = PoolDocument {
            version: "1".into(),
            accounts: vec![account],
            cursor: 17,
            settings: PoolSettings::default(),
        };
        write_atomic(&path, &doc).unwrap();

        let pool = AccountPool::load(path, PoolSettings::default()).unwrap();
        let snapshot = pool.snapshot().await;
        assert!(snapshot[0].rate_limits.is_empty());
        assert!(matches!(pool.select("m", None).await, Selection::Account(_)));
    }

    #[tokio::test]
    async fn invalid_account_is_never_selected() {
        let (pool, _dir) = temp_pool(SelectionStrategy::Sticky, &["a@x", "b@x"]).await;
        pool.mark_invalid("a@x", "invalid_grant").await;
        let now = 1_000_000;
        assert_eq!(email(pool.select_at("m", None, now).await), "b@x");
        pool.mark_invalid("b@x", "invalid_grant").await;
        assert!(matches!(
            pool.select_at("m", None, now).await,
            Selection::Empty
        ));
    }

    #[tokio::test]
    async fn upsert_respects_max_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = PoolSettings::default();
        settings.max_accounts = 1;
        let pool = AccountPool::new(dir.path().join("accounts.json"), settings);
        pool.upsert_account(Account::oauth("a@x".into(), "rt".into()))
            .await
            .unwrap();
        assert!(pool
            .upsert_account(Account::oauth("b@x".into(), "rt".into()))
            .await
            .is_err());
        // Updating an existing account is always allowed.
        assert!(pool
            .upsert_account(Account::oauth("a@x".into(), "rt2".into()))
            .await
            .is_ok());
    }
}
