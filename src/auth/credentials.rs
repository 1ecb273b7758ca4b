use crate::constants;
use crate::error::{ProxyError, ProxyResult};
use crate::models::CredentialSource;
use crate::proxy::pool::SelectedAccount;
use dashmap::DashMap;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    // Unix seconds.
    expires_at: i64,
}

// Produces a usable bearer token and project id per account on demand.
// Tokens are cached with a TTL and invalidated by any upstream 401; project
// ids are cached for the process lifetime. Refreshes are single-flighted so
// concurrent requests for one account coalesce on one grant call.
pub struct CredentialStore {
    tokens: DashMap<String, CachedToken>,
    projects: DashMap<String, String>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    token_ttl_minutes: i64,
}

impl CredentialStore {
    pub fn new(token_ttl_minutes: i64) -> Self {
        Self {
            tokens: DashMap::new(),
            projects: DashMap::new(),
            refresh_locks: DashMap::new(),
            token_ttl_minutes,
        }
    }

    pub async fn access_token(&self, account: &SelectedAccount) -> ProxyResult<String> {
        match account.source {
            CredentialSource::Manual => account.api_key.clone().ok_or_else(|| {
                ProxyError::AuthInvalid(format!("account {} has no stored key", account.email))
            }),
            CredentialSource::Database => self.token_from_ide_database(&account.email).await,
            CredentialSource::Oauth => self.oauth_token(account).await,
        }
    }

    async fn oauth_token(&self, account: &SelectedAccount) -> ProxyResult<String> {
        let now = chrono::Utc::now().timestamp();
        if let Some(cached) = self.tokens.get(&account.email) {
            if cached.expires_at > now {
                return Ok(cached.access_token.clone());
            }
        }

        let lock = self
            .refresh_locks
            .entry(account.email.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have refreshed while this one waited.
        if let Some(cached) = self.tokens.get(&account.email) {
            if cached.expires_at > now {
                return Ok(cached.access_token.clone());
            }
        }

        let refresh_token = account.refresh_token.clone().ok_or_else(|| {
            ProxyError::AuthInvalid(format!("account {} has no refresh token", account.email))
        })?;
        debug!("refreshing access token for {}", account.email);
        let response = super::oauth::refresh_access_token(&refresh_token).await?;

        let ttl_secs = (self.token_ttl_minutes * 60).min(response.expires_in.max(60));
        self.tokens.insert(
            account.email.clone(),
            CachedToken {
                access_token: response.access_token.clone(),
                expires_at: now + ttl_secs,
            },
        );
        Ok(response.access_token)
    }

    // The host IDE keeps its session token in a key-value SQLite store.
    async fn token_from_ide_database(&self, email: &str) -> ProxyResult<String> {
        let now = chrono::Utc::now().timestamp();
        if let Some(cached) = self.tokens.get(email) {
            if cached.expires_at > now {
                return Ok(cached.access_token.clone());
            }
        }
        let token = tokio::task::spawn_blocking(read_ide_database_token)
            .await
            .map_err(|e| ProxyError::Unknown(format!("database read task failed: {}", e)))??;
        self.tokens.insert(
            email.to_string(),
            CachedToken {
                access_token: token.clone(),
                expires_at: now + self.token_ttl_minutes * 60,
            },
        );
        Ok(token)
    }

    // Project id precedence: value stored on the account, then the cached
    // discovery result, then loadCodeAssist across the mirrors, then the
    // shared default.
    pub async fn project_id(&self, account: &SelectedAccount, access_token: &str) -> String {
        if let Some(stored) = &account.project_id {
            return stored.clone();
        }
        if let Some(cached) = self.projects.get(&account.email) {
            return cached.clone();
        }
        let discovered = discover_project_id(access_token).await.unwrap_or_else(|| {
            warn!(
                "account {} is ineligible for a companion project, using default",
                account.email
            );
            constants::DEFAULT_PROJECT_ID.to_string()
        });
        self.projects
            .insert(account.email.clone(), discovered.clone());
        discovered
    }

    // Any upstream 401 lands here: both caches go so the next attempt does a
    // fresh refresh and rediscovery.
    pub fn invalidate(&self, email: &str) {
        self.tokens.remove(email);
        self.projects.remove(email);
        info!("invalidated credential caches for {}", email);
    }

    pub fn clear(&self) -> usize {
        let count = self.tokens.len();
        self.tokens.clear();
        self.projects.clear();
        count
    }
}

async fn discover_project_id(access_token: &str) -> Option<String> {
    let client = crate::utils::http::get_client();
    for mirror in constants::UPSTREAM_MIRRORS {
        let url = format!("{}:loadCodeAssist", mirror);
        let response = client
            .post(&url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "metadata": { "ideType": "IDE_UNSPECIFIED" } }))
            .send()
            .await;
        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("loadCodeAssist at {} returned {}", mirror, r.status());
                continue;
            }
            Err(e) => {
                debug!("loadCodeAssist at {} failed: {}", mirror, e);
                continue;
            }
        };
        let Ok(data) = response.json::<Value>().await else {
            continue;
        };
        // Either a bare string or a nested object with an id.
        if let Some(project) = data.get("cloudaicompanionProject") {
            if let Some(id) = project.as_str() {
                return Some(id.to_string());
            }
            if let Some(id) = project.get("id").and_then(|v| v.as_str()) {
                return Some(id.to_string());
            }
        }
    }
    None
}

fn ide_database_path() -> ProxyResult<PathBuf> {
    if let Ok(custom) = std::env::var("VIADUCT_IDE_DB_PATH") {
        let path = PathBuf::from(custom);
        if path.exists() {
            return Ok(path);
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| ProxyError::Unknown("failed to resolve home directory".into()))?;
    #[cfg(target_os = "macos")]
    let path = home.join("Library/Application Support/CloudCode/User/globalStorage/state.vscdb");
    #[cfg(target_os = "windows")]
    let path = home.join("AppData/Roaming/CloudCode/User/globalStorage/state.vscdb");
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let path = home.join(".config/CloudCode/User/globalStorage/state.vscdb");
    Ok(path)
}

fn read_ide_database_token() -> ProxyResult<String> {
    let path = ide_database_path()?;
    if !path.exists() {
        return Err(ProxyError::AuthInvalid(format!(
            "host IDE database not found at {:?}",
            path
        )));
    }
    let conn = rusqlite::Connection::open_with_flags(
        &path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|e| ProxyError::Unknown(format!("failed to open IDE database: {}", e)))?;
    let raw: String = conn
        .query_row(
            "SELECT value FROM ItemTable WHERE key = ?1",
            ["cloudcode.authSession"],
            |row| row.get(0),
        )
        .map_err(|e| ProxyError::AuthInvalid(format!("no auth session in IDE database: {}", e)))?;
    let session: Value = serde_json::from_str(&raw)
        .map_err(|e| ProxyError::AuthInvalid(format!("corrupt IDE auth session: {}", e)))?;
    session
        .get("accessToken")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| ProxyError::AuthInvalid("IDE auth session has no access token".into()))
}
