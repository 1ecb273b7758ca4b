use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    // Pin each session fingerprint to one account to keep the upstream
    // prompt cache warm.
    Sticky,
    RoundRobin,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSettings {
    pub reward: i32,
    pub rate_limit_penalty: i32,
    pub failure_penalty: i32,
    pub recovery_per_hour: i32,
    pub min_usable: i32,
    pub max_score: i32,
    pub sticky_margin: f64,
    pub bucket_weight: f64,
    pub tokens_per_minute: f64,
    pub max_bucket_tokens: f64,
}

impl Default for HybridSettings {
    fn default() -> Self {
        Self {
            reward: 1,
            rate_limit_penalty: 10,
            failure_penalty: 20,
            recovery_per_hour: 2,
            min_usable: 20,
            max_score: 100,
            sticky_margin: 5.0,
            bucket_weight: 2.0,
            tokens_per_minute: 6.0,
            max_bucket_tokens: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub strategy: SelectionStrategy,
    pub default_cooldown_ms: u64,
    pub max_wait_before_error_ms: u64,
    pub rate_limit_dedup_window_ms: u64,
    pub max_consecutive_failures: u32,
    pub extended_cooldown_ms: u64,
    pub max_accounts: usize,
    pub hybrid: HybridSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Hybrid,
            default_cooldown_ms: 60_000,
            max_wait_before_error_ms: 120_000,
            rate_limit_dedup_window_ms: 5_000,
            max_consecutive_failures: 3,
            extended_cooldown_ms: 60_000,
            max_accounts: 10,
            hybrid: HybridSettings::default(),
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.default_cooldown_ms > 600_000 {
            errors.push("default_cooldown_ms must be at most 10 minutes".to_string());
        }
        if !(60_000..=1_800_000).contains(&self.max_wait_before_error_ms) {
            errors.push("max_wait_before_error_ms must be within 1-30 minutes".to_string());
        }
        if !(1_000..=30_000).contains(&self.rate_limit_dedup_window_ms) {
            errors.push("rate_limit_dedup_window_ms must be within 1-30 seconds".to_string());
        }
        if !(1..=10).contains(&self.max_consecutive_failures) {
            errors.push("max_consecutive_failures must be within 1-10".to_string());
        }
        if !(10_000..=300_000).contains(&self.extended_cooldown_ms) {
            errors.push("extended_cooldown_ms must be within 10 seconds and 5 minutes".to_string());
        }
        if !(1..=100).contains(&self.max_accounts) {
            errors.push("max_accounts must be within 1-100".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub token_ttl_minutes: i64,
    pub pool: PoolSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8425,
            max_retries: 3,
            request_timeout_secs: 600,
            token_ttl_minutes: 50,
            pool: PoolSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.max_retries > 20 {
            errors.push("max_retries must be at most 20".to_string());
        }
        if self.request_timeout_secs == 0 {
            errors.push("request_timeout_secs must be positive".to_string());
        }
        if self.token_ttl_minutes <= 0 {
            errors.push("token_ttl_minutes must be positive".to_string());
        }
        if let Err(pool_errors) = self.pool.validate() {
            errors.extend(pool_errors);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn config_dir() -> Result<PathBuf, String> {
        let base = dirs::config_dir().ok_or("failed to resolve user config directory")?;
        let dir = base.join("viaduct");
        std::fs::create_dir_all(&dir).map_err(|e| format!("failed to create config dir: {}", e))?;
        Ok(dir)
    }

    pub fn load() -> Result<Self, String> {
        let path = Self::config_dir()?.join("config.json");
        if !path.exists() {
            let config = Self::default();
            let _ = config.save();
            return Ok(config);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read config file: {}", e))?;
        serde_json::from_str(&content).map_err(|e| format!("failed to parse config file: {}", e))
    }

    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_dir()?.join("config.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize config: {}", e))?;
        std::fs::write(&path, content).map_err(|e| format!("failed to save config: {}", e))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            match port.trim().parse::<u16>() {
                Ok(p) if p > 0 => {
                    tracing::info!("Using proxy port from environment: {}", p);
                    self.port = p;
                }
                _ => tracing::warn!("ignoring invalid PORT value: {}", port),
            }
        }
        if let Ok(host) = std::env::var("HOST") {
            if !host.trim().is_empty() {
                self.host = host.trim().to_string();
            }
        }
    }
}
